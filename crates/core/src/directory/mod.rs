//! Directory access: the transport seam, the failover/paging client and the
//! `ldap3`-backed production transport.
//!
//! The [`DirectoryClient`] owns the ordered failover list and the paging
//! loop; a [`DirectoryTransport`] only knows how to bind one URI and fetch
//! one page.

pub mod client;
pub mod filter;
pub mod ldap;

use std::future::Future;

use crate::errors::DirectoryError;
use crate::models::DirectoryItem;

pub use client::{DirectoryClient, PagedSearch, SearchOutcome};
pub use ldap::LdapTransport;

/// A subtree search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub base: String,
    pub filter: String,
    pub attributes: Vec<String>,
}

/// One page of results and the cookie for the next one.
///
/// An empty cookie means the result set is exhausted.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub items: Vec<DirectoryItem>,
    pub cookie: Vec<u8>,
}

/// Opens authenticated sessions against a single endpoint URI.
pub trait DirectoryTransport: Send + Sync {
    type Session: DirectorySession;

    /// Connect to `uri` and perform a simple bind.
    fn bind(
        &self,
        uri: &str,
        bind_dn: &str,
        password: &str,
    ) -> impl Future<Output = Result<Self::Session, DirectoryError>> + Send;
}

/// An authenticated connection to one endpoint.
pub trait DirectorySession: Send {
    /// Fetch one page of a paged search, resuming from `cookie`.
    fn search_page(
        &mut self,
        query: &SearchQuery,
        page_size: u32,
        cookie: &[u8],
    ) -> impl Future<Output = Result<SearchPage, DirectoryError>> + Send;

    /// Close the session.
    fn unbind(self) -> impl Future<Output = Result<(), DirectoryError>> + Send
    where
        Self: Sized;
}

/// Whether the URI demands TLS from the first byte.
pub fn uses_tls(uri: &str) -> bool {
    uri.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("ldaps://"))
}
