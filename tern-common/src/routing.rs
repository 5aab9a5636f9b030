//! A table driven [`AliasExpander`].
//!
//! Local domains are delivered through the local mailer, everything else is
//! relayed through the relay mailer. Local parts are looked up in the alias
//! table first; an alias may point at other aliases, remote addresses, files
//! (`/path`) or programs (`|command`). An `owner-<alias>` entry makes its
//! value the responsible owner of every recipient the alias expands to.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    address::Address,
    dsn::DsnNotify,
    mailer::{MailerDescriptor, MailerKind},
    recipient::Recipient,
    status::{EnhancedStatus, Reply, Status},
    traits::AliasExpander,
};

const MAX_ALIAS_DEPTH: usize = 10;

fn default_local_mailer() -> String {
    "local".to_string()
}

fn default_relay_mailer() -> String {
    "esmtp".to_string()
}

fn default_program_mailer() -> String {
    "prog".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub local_domains: Vec<String>,
    #[serde(default)]
    pub aliases: AHashMap<String, Vec<String>>,
    #[serde(default = "default_local_mailer")]
    pub local_mailer: String,
    #[serde(default = "default_relay_mailer")]
    pub relay_mailer: String,
    #[serde(default = "default_program_mailer")]
    pub program_mailer: String,
    /// Relay everything non-local through this host instead of the
    /// recipient's domain
    #[serde(default)]
    pub smart_host: Option<String>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            local_domains: Vec::new(),
            aliases: AHashMap::new(),
            local_mailer: default_local_mailer(),
            relay_mailer: default_relay_mailer(),
            program_mailer: default_program_mailer(),
            smart_host: None,
        }
    }
}

pub struct StaticRouter {
    table: RoutingTable,
    mailers: AHashMap<String, Arc<MailerDescriptor>>,
    file: Arc<MailerDescriptor>,
}

impl StaticRouter {
    pub fn new(mut table: RoutingTable, mailers: &[Arc<MailerDescriptor>]) -> Self {
        for domain in &mut table.local_domains {
            domain.make_ascii_lowercase();
        }
        table.aliases = table
            .aliases
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        Self {
            table,
            mailers: mailers
                .iter()
                .map(|m| (m.name.clone(), Arc::clone(m)))
                .collect(),
            file: Arc::new(MailerDescriptor::file()),
        }
    }

    fn is_local(&self, address: &Address) -> bool {
        address
            .domain()
            .is_none_or(|d| self.table.local_domains.iter().any(|l| l == d))
    }

    fn mailer(&self, name: &str) -> Result<Arc<MailerDescriptor>, Reply> {
        self.mailers.get(name).cloned().ok_or_else(|| {
            Reply::new(
                Status::ActionUnavailable,
                Some(EnhancedStatus::new(4, 3, 5)),
                format!("Mailer {name} is not configured"),
            )
        })
    }

    fn bind(&self, address: &Address, notify: DsnNotify) -> Result<Recipient, Reply> {
        if self.is_local(address) {
            let mailer = self.mailer(&self.table.local_mailer)?;
            return Ok(Recipient::new(address.clone(), mailer, "localhost")
                .with_user(address.local())
                .with_notify(notify));
        }

        let mailer = self.mailer(&self.table.relay_mailer)?;
        let host = self
            .table
            .smart_host
            .clone()
            .or_else(|| address.domain().map(ToString::to_string))
            .unwrap_or_default();

        Ok(Recipient::new(address.clone(), mailer, host).with_notify(notify))
    }

    fn bind_target(
        &self,
        alias: &Address,
        target: &str,
        notify: DsnNotify,
    ) -> Result<Option<Recipient>, Reply> {
        if target.starts_with('/') {
            return Ok(Some(
                Recipient::new(alias.clone(), Arc::clone(&self.file), "localhost")
                    .with_user(target)
                    .with_notify(notify),
            ));
        }

        if let Some(command) = target.strip_prefix('|') {
            let mailer = self.mailer(&self.table.program_mailer)?;
            if !matches!(mailer.kind, MailerKind::Local { .. }) {
                return Err(Reply::new(
                    Status::Error,
                    Some(EnhancedStatus::new(5, 3, 5)),
                    "Program delivery is not available",
                ));
            }
            return Ok(Some(
                Recipient::new(alias.clone(), mailer, "localhost")
                    .with_user(command.trim())
                    .with_notify(notify),
            ));
        }

        Ok(None)
    }

    fn expand_into(
        &self,
        address: &Address,
        notify: DsnNotify,
        owner: Option<&str>,
        depth: usize,
        seen: &mut AHashSet<String>,
        out: &mut Vec<Recipient>,
    ) -> Result<(), Reply> {
        let key = address.local().to_ascii_lowercase();
        let alias = self
            .is_local(address)
            .then(|| self.table.aliases.get(&key))
            .flatten();

        let Some(targets) = alias else {
            let mut recipient = self.bind(address, notify)?;
            recipient.owner = owner.map(ToString::to_string);
            out.push(recipient);
            return Ok(());
        };

        if depth >= MAX_ALIAS_DEPTH || !seen.insert(key.clone()) {
            return Err(Reply::new(
                Status::TransactionFailed,
                Some(EnhancedStatus::new(5, 4, 6)),
                format!("Alias loop detected for {address}"),
            ));
        }

        let owner_key = format!("owner-{key}");
        let owner = self
            .table
            .aliases
            .get(&owner_key)
            .and_then(|o| o.first())
            .map(String::as_str)
            .or(owner);

        for target in targets {
            if let Some(mut recipient) = self.bind_target(address, target, notify)? {
                recipient.owner = owner.map(ToString::to_string);
                out.push(recipient);
                continue;
            }

            let target = if target.contains('@') {
                Address::parse(target)
            } else {
                Address::parse(&format!(
                    "{target}@{}",
                    address.domain().unwrap_or("localhost")
                ))
            }
            .map_err(|e| {
                Reply::new(
                    Status::TransactionFailed,
                    Some(EnhancedStatus::new(5, 3, 0)),
                    format!("Bad alias target {target}: {e}"),
                )
            })?;

            self.expand_into(&target, notify, owner, depth + 1, seen, out)?;
        }

        seen.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl AliasExpander for StaticRouter {
    async fn expand(&self, address: &Address, notify: DsnNotify) -> Result<Vec<Recipient>, Reply> {
        let mut out = Vec::new();
        let mut seen = AHashSet::new();
        self.expand_into(address, notify, None, 0, &mut seen, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> StaticRouter {
        let mut aliases = AHashMap::new();
        aliases.insert(
            "team".to_string(),
            vec![
                "alice".to_string(),
                "bob@remote.example".to_string(),
                "/var/mail/archive".to_string(),
            ],
        );
        aliases.insert("owner-team".to_string(), vec!["team-owner".to_string()]);
        aliases.insert("loop".to_string(), vec!["loop".to_string()]);

        StaticRouter::new(
            RoutingTable {
                local_domains: vec!["Example.com".to_string()],
                aliases,
                ..RoutingTable::default()
            },
            &[
                Arc::new(MailerDescriptor::local("local", "/bin/cat", vec![])),
                Arc::new(MailerDescriptor::esmtp("esmtp")),
            ],
        )
    }

    #[tokio::test]
    async fn remote_addresses_relay_by_domain() {
        let router = router();
        let out = router
            .expand(&Address::parse("x@remote.example").unwrap(), DsnNotify::default())
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mailer.name, "esmtp");
        assert_eq!(out[0].host, "remote.example");
        assert!(out[0].owner.is_none());
    }

    #[tokio::test]
    async fn alias_expands_with_owner() {
        let router = router();
        let out = router
            .expand(&Address::parse("team@example.com").unwrap(), DsnNotify::default())
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].mailer.name, "local");
        assert_eq!(out[0].user, "alice");
        assert_eq!(out[1].host, "remote.example");
        assert_eq!(out[2].mailer.name, "*file*");
        assert_eq!(out[2].user, "/var/mail/archive");
        assert!(out.iter().all(|r| r.owner.as_deref() == Some("team-owner")));
    }

    #[tokio::test]
    async fn alias_loops_are_rejected() {
        let router = router();
        let err = router
            .expand(&Address::parse("loop@example.com").unwrap(), DsnNotify::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, Status::TransactionFailed);
    }
}
