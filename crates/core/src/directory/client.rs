//! Failover-aware directory client with paged searches.

use tracing::{debug, info, warn};

use super::{DirectorySession, DirectoryTransport, SearchQuery};
use crate::errors::DirectoryError;
use crate::models::DirectoryItem;

/// Result of a completed search and the endpoint that served it.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub uri: String,
    pub items: Vec<DirectoryItem>,
}

/// Client over an ordered list of endpoint URIs.
///
/// The first URI that accepts the bind serves the search and is moved to the
/// front of the list. Its session is cached until a search on it fails or the
/// client is closed.
pub struct DirectoryClient<'t, T: DirectoryTransport> {
    transport: &'t T,
    uris: Vec<String>,
    bind_dn: String,
    password: String,
    page_size: u32,
    session: Option<(String, T::Session)>,
    working_uri: Option<String>,
}

impl<'t, T: DirectoryTransport> DirectoryClient<'t, T> {
    pub fn new(
        transport: &'t T,
        uris: Vec<String>,
        bind_dn: impl Into<String>,
        password: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            transport,
            uris,
            bind_dn: bind_dn.into(),
            password: password.into(),
            page_size,
            session: None,
            working_uri: None,
        }
    }

    /// Current failover order.
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// The endpoint of the most recent successful bind.
    pub fn working_uri(&self) -> Option<&str> {
        self.working_uri.as_deref()
    }

    /// Run one search, failing over across endpoints.
    ///
    /// `plan` is called with the URI about to be searched so the caller can
    /// pick a filter that depends on the endpoint (its sync cursor). A bind
    /// failure or a failed search moves on to the next URI.
    pub async fn search_with<F, E>(&mut self, mut plan: F) -> Result<SearchOutcome, E>
    where
        F: FnMut(&str) -> Result<SearchQuery, E>,
        E: From<DirectoryError>,
    {
        if self.uris.is_empty() {
            return Err(DirectoryError::NoEndpoints.into());
        }

        let candidates = self.uris.clone();
        let mut last_error = String::new();

        for uri in &candidates {
            let cached = matches!(&self.session, Some((bound, _)) if bound == uri);
            if !cached {
                self.close_session().await;
                match self.transport.bind(uri, &self.bind_dn, &self.password).await {
                    Ok(session) => {
                        info!(uri = %uri, "bound to directory endpoint");
                        self.promote(uri);
                        self.session = Some((uri.clone(), session));
                    }
                    Err(e) => {
                        warn!(uri = %uri, error = %e, "bind failed, trying next endpoint");
                        last_error = e.to_string();
                        continue;
                    }
                }
            }

            let query = plan(uri.as_str())?;
            let result = match self.session.as_mut() {
                Some((_, session)) => {
                    PagedSearch::new(session, &query, self.page_size)
                        .collect_all()
                        .await
                }
                None => continue,
            };

            match result {
                Ok(items) => {
                    debug!(uri = %uri, count = items.len(), filter = %query.filter, "search complete");
                    return Ok(SearchOutcome {
                        uri: uri.clone(),
                        items,
                    });
                }
                Err(e) => {
                    warn!(uri = %uri, error = %e, "search failed, dropping session");
                    last_error = e.to_string();
                    self.close_session().await;
                }
            }
        }

        Err(DirectoryError::AllEndpointsFailed {
            tried: candidates.len(),
            last_error,
        }
        .into())
    }

    /// Run a search whose query does not depend on the endpoint.
    pub async fn search(&mut self, query: &SearchQuery) -> Result<SearchOutcome, DirectoryError> {
        self.search_with(|_| Ok::<_, DirectoryError>(query.clone()))
            .await
    }

    /// Unbind the cached session and return the failover order for the next
    /// run.
    pub async fn close(mut self) -> Vec<String> {
        self.close_session().await;
        self.uris
    }

    fn promote(&mut self, uri: &str) {
        if let Some(pos) = self.uris.iter().position(|u| u == uri) {
            let promoted = self.uris.remove(pos);
            self.uris.insert(0, promoted);
        }
        self.working_uri = Some(uri.to_string());
    }

    async fn close_session(&mut self) {
        if let Some((uri, session)) = self.session.take() {
            if let Err(e) = session.unbind().await {
                debug!(uri = %uri, error = %e, "unbind failed");
            }
        }
    }
}

/// Lazy producer of result pages for one query on one session.
///
/// Finite and not restartable: once the directory returns an empty cookie,
/// or a page fails, [`next_page`](Self::next_page) yields `None`.
pub struct PagedSearch<'a, S: DirectorySession> {
    session: &'a mut S,
    query: &'a SearchQuery,
    page_size: u32,
    cookie: Vec<u8>,
    pages: usize,
    done: bool,
}

impl<'a, S: DirectorySession> PagedSearch<'a, S> {
    pub fn new(session: &'a mut S, query: &'a SearchQuery, page_size: u32) -> Self {
        Self {
            session,
            query,
            page_size,
            cookie: Vec::new(),
            pages: 0,
            done: false,
        }
    }

    /// Fetch the next page, or `None` once the result set is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<DirectoryItem>>, DirectoryError> {
        if self.done {
            return Ok(None);
        }
        let page = match self
            .session
            .search_page(self.query, self.page_size, &self.cookie)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        self.pages += 1;
        debug!(
            page = self.pages,
            items = page.items.len(),
            more = !page.cookie.is_empty(),
            "received result page"
        );
        self.done = page.cookie.is_empty();
        self.cookie = page.cookie;
        Ok(Some(page.items))
    }

    /// Drain every page into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<DirectoryItem>, DirectoryError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        Ok(items)
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}
