//! Production directory transport built on `ldap3`.
//!
//! `ldaps://` URIs get TLS with certificate validation (optionally trusting an
//! extra CA from `directory.ca_cert`); any other scheme connects in plain
//! text with StartTLS disabled.

use std::collections::BTreeMap;
use std::time::Duration;

use ldap3::controls::{Control, ControlType, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, ResultEntry, Scope, SearchEntry};
use tracing::{debug, warn};

use super::{uses_tls, DirectorySession, DirectoryTransport, SearchPage, SearchQuery};
use crate::config::DirectoryConfig;
use crate::errors::DirectoryError;
use crate::models::{DirectoryItem, DirectoryRecord};

/// Opens `ldap3` connections.
#[derive(Clone)]
pub struct LdapTransport {
    timeout: Duration,
    tls_connector: Option<native_tls::TlsConnector>,
}

impl LdapTransport {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let tls_connector = match &config.ca_cert {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    DirectoryError::Tls(format!("reading CA certificate {}: {e}", path.display()))
                })?;
                let cert = native_tls::Certificate::from_pem(&pem)
                    .map_err(|e| DirectoryError::Tls(format!("parsing CA certificate: {e}")))?;
                let connector = native_tls::TlsConnector::builder()
                    .add_root_certificate(cert)
                    .build()
                    .map_err(|e| DirectoryError::Tls(e.to_string()))?;
                Some(connector)
            }
            None => None,
        };

        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs),
            tls_connector,
        })
    }

    fn settings(&self, uri: &str) -> LdapConnSettings {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(false);
        if uses_tls(uri) {
            if let Some(connector) = &self.tls_connector {
                settings = settings.set_connector(connector.clone());
            }
        }
        settings
    }
}

/// A bound `ldap3` handle.
pub struct LdapSession {
    uri: String,
    ldap: Ldap,
    timeout: Duration,
}

impl DirectoryTransport for LdapTransport {
    type Session = LdapSession;

    async fn bind(
        &self,
        uri: &str,
        bind_dn: &str,
        password: &str,
    ) -> Result<LdapSession, DirectoryError> {
        debug!(uri, tls = uses_tls(uri), "connecting to directory");
        let bind_failed = |detail: String| DirectoryError::BindFailed {
            uri: uri.to_string(),
            detail,
        };

        let (conn, mut ldap) = LdapConnAsync::with_settings(self.settings(uri), uri)
            .await
            .map_err(|e| bind_failed(e.to_string()))?;

        let driver_uri = uri.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(uri = %driver_uri, error = %e, "LDAP connection driver error");
            }
        });

        ldap.with_timeout(self.timeout)
            .simple_bind(bind_dn, password)
            .await
            .and_then(|result| result.success())
            .map_err(|e| bind_failed(e.to_string()))?;

        Ok(LdapSession {
            uri: uri.to_string(),
            ldap,
            timeout: self.timeout,
        })
    }
}

impl DirectorySession for LdapSession {
    async fn search_page(
        &mut self,
        query: &SearchQuery,
        page_size: u32,
        cookie: &[u8],
    ) -> Result<SearchPage, DirectoryError> {
        let control = PagedResults {
            size: i32::try_from(page_size).unwrap_or(i32::MAX),
            cookie: cookie.to_vec(),
        };
        let search_failed = |detail: String| DirectoryError::SearchFailed {
            uri: self.uri.clone(),
            detail,
        };

        let result = self
            .ldap
            .with_controls(control)
            .with_timeout(self.timeout)
            .search(
                &query.base,
                Scope::Subtree,
                &query.filter,
                query.attributes.clone(),
            )
            .await
            .map_err(|e| search_failed(e.to_string()))?;
        let (entries, outcome) = result
            .success()
            .map_err(|e| search_failed(e.to_string()))?;

        let cookie = outcome
            .ctrls
            .iter()
            .find_map(|ctrl| match ctrl {
                Control(Some(ControlType::PagedResults), raw) => {
                    Some(raw.parse::<PagedResults>().cookie)
                }
                _ => None,
            })
            .unwrap_or_default();

        Ok(SearchPage {
            items: entries.into_iter().map(convert_entry).collect(),
            cookie,
        })
    }

    async fn unbind(mut self) -> Result<(), DirectoryError> {
        self.ldap
            .unbind()
            .await
            .map_err(|e| DirectoryError::SearchFailed {
                uri: self.uri.clone(),
                detail: format!("unbind: {e}"),
            })
    }
}

fn convert_entry(entry: ResultEntry) -> DirectoryItem {
    if entry.is_ref() {
        return DirectoryItem::Malformed {
            dn: None,
            reason: "search continuation reference".into(),
        };
    }
    if entry.is_intermediate() {
        return DirectoryItem::Malformed {
            dn: None,
            reason: "intermediate response".into(),
        };
    }

    let entry = SearchEntry::construct(entry);
    let mut attributes: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
    for (name, values) in entry.attrs {
        attributes.insert(name, values.into_iter().map(String::into_bytes).collect());
    }
    for (name, values) in entry.bin_attrs {
        attributes.entry(name).or_default().extend(values);
    }
    DirectoryItem::Record(DirectoryRecord {
        dn: entry.dn,
        attributes,
    })
}
