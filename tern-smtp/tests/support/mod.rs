//! Runs a real tern SMTP listener on a loopback port.

use std::{net::SocketAddr, time::Duration};

use ahash::AHashMap;
use tern_common::{
    Signal,
    traits::protocol::{Protocol, SessionHandler},
};
use tern_smtp::{Smtp, SmtpArgs};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: broadcast::Sender<Signal>,
    pub handle: JoinHandle<()>,
}

/// Binds port 0 and serves every accepted connection with `args`
pub async fn start_server(mut args: SmtpArgs) -> TestServer {
    let mut smtp = Smtp;
    smtp.validate(&mut args).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);

    let signal = shutdown.clone();
    let handle = tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let session = smtp.handle(stream, peer, AHashMap::default(), args.clone());
            let signal = signal.subscribe();

            tokio::spawn(async move {
                let _ = tokio::time::timeout(Duration::from_secs(30), session.run(signal)).await;
            });
        }
    });

    TestServer {
        addr,
        shutdown,
        handle,
    }
}
