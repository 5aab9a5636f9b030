//! Handing a message to a local program on its standard input.

use std::{io, path::Path, process::Stdio};

use tern_common::{Envelope, ExitCode, Reply};
use tokio::{io::AsyncWriteExt, process::Command, time::Instant};
use tracing::{debug, warn};

use super::{Batch, DeliveryEngine, pending};
use crate::error::{DeliveryError, TemporaryError};

/// Expands the argument template for one transaction.
///
/// An argument mentioning `$u` is repeated once per recipient; `$h` is the
/// recipient host, `$f` and `$g` the sender (`<>` when there is none).
fn expand_argv(template: &[String], users: &[&str], host: &str, sender: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(template.len() + users.len());

    for arg in template {
        if arg.contains("$u") {
            args.extend(
                users
                    .iter()
                    .map(|&user| substitute(arg, Some(user), host, sender)),
            );
        } else {
            args.push(substitute(arg, None, host, sender));
        }
    }

    args
}

/// Replaces the macros of one argument in a single pass, so text a macro
/// expands to is never expanded again
fn substitute(arg: &str, user: Option<&str>, host: &str, sender: &str) -> String {
    let mut expanded = String::with_capacity(arg.len());
    let mut chars = arg.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            let value = match chars.peek() {
                Some('u') => user,
                Some('h') => Some(host),
                Some('f' | 'g') => Some(sender),
                _ => None,
            };
            if let Some(value) = value {
                chars.next();
                expanded.push_str(value);
                continue;
            }
        }
        expanded.push(c);
    }

    expanded
}

/// The first line a program printed, preferring its error output
fn diagnostic(stderr: &[u8], stdout: &[u8]) -> Option<String> {
    [stderr, stdout].into_iter().find_map(|output| {
        String::from_utf8_lossy(output)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(ToString::to_string)
    })
}

impl DeliveryEngine {
    pub(super) async fn deliver_local(
        &self,
        envelope: &mut Envelope,
        batch: &Batch,
        program: &Path,
        argv: &[String],
        started: Instant,
    ) {
        let members = pending(envelope, &batch.members);
        let Some(&head) = members.first() else {
            return;
        };
        let Some(body) = envelope.body.clone() else {
            let err = DeliveryError::from(io::Error::new(
                io::ErrorKind::NotFound,
                "message body missing",
            ));
            self.fail_members(envelope, &members, &err, None, started);
            return;
        };

        let mailer = &batch.mailer;
        let recipients = envelope.recipients();
        let users = members
            .iter()
            .filter_map(|&idx| recipients.get(idx).map(|r| r.user.as_str()))
            .collect::<Vec<_>>();
        let host = recipients.get(head).map_or("", |r| r.host.as_str());
        let sender = envelope
            .sender()
            .map_or_else(|| "<>".to_string(), ToString::to_string);
        let args = expand_argv(argv, &users, host, &sender);

        let identity = if mailer.flags.fixed_identity {
            mailer.default_identity.clone()
        } else {
            recipients
                .get(head)
                .and_then(|r| r.owner.clone())
                .or_else(|| envelope.owner.clone())
                .or_else(|| mailer.default_identity.clone())
        };

        debug!(program = %program.display(), ?args, ?identity, "Spawning mailer");

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(identity) = &identity {
            command.env("USER", identity).env("LOGNAME", identity);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %program.display(), %err, "Cannot spawn mailer");
                let err = DeliveryError::from(err);
                self.fail_members(envelope, &members, &err, None, started);
                return;
            }
        };

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&body).await {
                // The program may legitimately stop reading early
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        let limit = self.config.timeouts.data_done();
        let Ok((fed, output)) =
            tokio::time::timeout(limit, async { tokio::join!(feed, child.wait_with_output()) })
                .await
        else {
            warn!(program = %program.display(), ?limit, "Mailer timed out");
            let err = DeliveryError::from(TemporaryError::Timeout(format!(
                "{} did not finish",
                program.display()
            )));
            self.fail_members(envelope, &members, &err, None, started);
            return;
        };

        let output = match (fed, output) {
            (Ok(()), Ok(output)) => output,
            (Err(err), _) | (_, Err(err)) => {
                let err = DeliveryError::from(err);
                self.fail_members(envelope, &members, &err, None, started);
                return;
            }
        };

        let Some(code) = output.status.code() else {
            // Killed by a signal
            let reply = Reply::from_parts(
                451,
                "4.3.0",
                format!("{} terminated abnormally", program.display()),
            );
            for &idx in &members {
                self.settle(envelope, idx, ExitCode::TempFail, &reply, None, started);
            }
            return;
        };

        let exit = ExitCode::from_raw(code);
        let mut reply = exit.reply();
        if exit != ExitCode::Ok
            && let Some(text) = diagnostic(&output.stderr, &output.stdout)
        {
            reply.text = text;
        }

        debug!(program = %program.display(), code, %reply, "Mailer finished");
        for &idx in &members {
            self.settle(envelope, idx, exit, &reply, None, started);
        }
    }
}
