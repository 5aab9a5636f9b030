//! The `*file*` mailer: appending the message to an mbox file.

use std::{io, path::Path, sync::Arc};

use chrono::Utc;
use tern_common::{Envelope, ExitCode};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, time::Instant};
use tracing::{debug, warn};

use super::{Batch, DeliveryEngine, pending};

/// The message as an mbox entry: a `From ` separator line, the body with
/// `>From ` quoting and a blank line to end it
fn mbox_entry(sender: &str, body: &[u8]) -> Vec<u8> {
    let date = Utc::now().format("%a %b %e %H:%M:%S %Y");
    let mut entry = format!("From {sender} {date}\n").into_bytes();
    entry.reserve(body.len() + 2);

    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b"From ") {
            entry.push(b'>');
        }
        match line.strip_suffix(b"\r\n") {
            Some(stripped) => {
                entry.extend_from_slice(stripped);
                entry.push(b'\n');
            }
            None => entry.extend_from_slice(line),
        }
    }

    if !entry.ends_with(b"\n") {
        entry.push(b'\n');
    }
    entry.push(b'\n');
    entry
}

async fn append(path: &Path, entry: &[u8]) -> Result<(), (ExitCode, io::Error)> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .map_err(|err| (ExitCode::CantCreat, err))?;

    let written = async {
        file.write_all(entry).await?;
        file.flush().await?;
        file.sync_data().await
    };
    written.await.map_err(|err| (ExitCode::from_io(&err), err))
}

impl DeliveryEngine {
    /// Each recipient's `user` names the file it wants the message in
    pub(super) async fn deliver_file(
        &self,
        envelope: &mut Envelope,
        batch: &Batch,
        started: Instant,
    ) {
        let members = pending(envelope, &batch.members);
        let sender = envelope
            .sender()
            .map_or_else(|| "MAILER-DAEMON".to_string(), ToString::to_string);
        let body = envelope.body.clone().unwrap_or_else(|| Arc::from(&[][..]));
        let entry = mbox_entry(&sender, &body);

        for idx in members {
            let Some(target) = envelope.recipients().get(idx).map(|r| r.user.clone()) else {
                continue;
            };
            let path = Path::new(&target);

            let (exit, reply) = if path.is_absolute() {
                match append(path, &entry).await {
                    Ok(()) => {
                        debug!(file = %path.display(), "Appended message");
                        (ExitCode::Ok, ExitCode::Ok.reply())
                    }
                    Err((exit, err)) => {
                        warn!(file = %path.display(), %err, "Cannot append to file");
                        let mut reply = exit.reply();
                        reply.text = format!("{}: {err}", path.display());
                        (exit, reply)
                    }
                }
            } else {
                let mut reply = ExitCode::CantCreat.reply();
                reply.text = format!("{target}: not an absolute path");
                (ExitCode::CantCreat, reply)
            };

            self.settle(envelope, idx, exit, &reply, None, started);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn body_of(entry: &[u8]) -> String {
        let text = String::from_utf8(entry.to_vec()).unwrap();
        let (separator, rest) = text.split_once('\n').unwrap();
        assert!(separator.starts_with("From sender@tern.test "));
        rest.to_string()
    }

    #[test]
    fn from_lines_are_quoted() {
        let entry = mbox_entry(
            "sender@tern.test",
            b"Subject: hi\r\n\r\nFrom here on\r\nnot From there\r\n",
        );
        assert_eq!(
            body_of(&entry),
            "Subject: hi\n\n>From here on\nnot From there\n\n"
        );
    }

    #[test]
    fn unterminated_bodies_are_closed() {
        let entry = mbox_entry("sender@tern.test", b"no newline");
        assert_eq!(body_of(&entry), "no newline\n\n");
    }

    #[tokio::test]
    async fn appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mbox");

        append(&path, b"one\n").await.unwrap();
        append(&path, b"two\n").await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn missing_directories_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("mbox");

        let (exit, _) = append(&path, b"one\n").await.unwrap_err();
        assert_eq!(exit, ExitCode::CantCreat);
    }
}
