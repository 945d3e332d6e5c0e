use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use store_directory_core::Store;
use store_directory_storage::{Database, StoreError, StoreRepository};

/// How a host name was mapped to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Domain,
    Default,
}

/// Outcome of resolving a request host.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub host: String,
    pub matched_by: MatchedBy,
    pub store: Store,
}

/// Maps request hosts to stores, falling back to the default store.
#[derive(Clone)]
pub struct StoreResolver {
    stores: StoreRepository,
}

impl StoreResolver {
    pub fn new(database: &Database) -> Self {
        Self {
            stores: database.stores(),
        }
    }

    /// Returns the earliest store owning `host`, or the default store when none does.
    ///
    /// The host is compared verbatim; callers strip schemes and ports.
    pub async fn resolve(&self, host: &str) -> Result<Resolution, ResolveError> {
        let matches = self.stores.find_by_domain(host).await?;
        if matches.len() > 1 {
            warn!(stage = "app", host, matches = matches.len(), "host claimed by several stores; using the earliest");
        }

        if let Some(store) = matches.into_iter().next() {
            debug!(stage = "app", host, store_id = %store.id(), "host matched by domain");
            return Ok(Resolution {
                host: host.to_string(),
                matched_by: MatchedBy::Domain,
                store,
            });
        }

        let store = self.stores.get_default().await?;
        debug!(stage = "app", host, store_id = %store.id(), "host fell back to default store");
        Ok(Resolution {
            host: host.to_string(),
            matched_by: MatchedBy::Default,
            store,
        })
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to resolve store: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use store_directory_core::{DirectoryError, NewStore};

    async fn setup_resolver() -> (Database, StoreResolver) {
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        let resolver = StoreResolver::new(&database);
        (database, resolver)
    }

    #[tokio::test]
    async fn resolves_host_by_domain() {
        let (database, resolver) = setup_resolver().await;
        let stores = database.stores();
        stores
            .create(NewStore::new("main").with_domains("main.example"))
            .await
            .expect("main");
        let outlet = stores
            .create(NewStore::new("outlet").with_domains("outlet.example\nwww.outlet.example"))
            .await
            .expect("outlet");

        let resolution = resolver.resolve("www.outlet.example").await.expect("resolve");
        assert_eq!(resolution.matched_by, MatchedBy::Domain);
        assert_eq!(resolution.store.id(), outlet.id());
    }

    #[tokio::test]
    async fn falls_back_to_default_store() {
        let (database, resolver) = setup_resolver().await;
        let stores = database.stores();
        stores
            .create(NewStore::new("main").with_domains("main.example"))
            .await
            .expect("main");
        let brand = stores
            .create(NewStore::new("brand").as_default())
            .await
            .expect("brand");

        let resolution = resolver.resolve("unknown.example").await.expect("resolve");
        assert_eq!(resolution.matched_by, MatchedBy::Default);
        assert_eq!(resolution.store.id(), brand.id());

        let json = serde_json::to_value(&resolution).expect("serialize");
        assert_eq!(json["matched_by"], "default");
        assert_eq!(json["store"]["create_your_own_link"], "");
    }

    #[tokio::test]
    async fn shared_domain_prefers_earliest_store() {
        let (database, resolver) = setup_resolver().await;
        let stores = database.stores();
        let first = stores
            .create(NewStore::new("first").with_domains("shared.example"))
            .await
            .expect("first");
        stores
            .create(NewStore::new("second").with_domains("shared.example"))
            .await
            .expect("second");

        let resolution = resolver.resolve("shared.example").await.expect("resolve");
        assert_eq!(resolution.store.id(), first.id());
    }

    #[tokio::test]
    async fn empty_directory_cannot_resolve() {
        let (_database, resolver) = setup_resolver().await;
        let err = resolver.resolve("any.example").await.expect_err("empty");
        let ResolveError::Store(err) = err;
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::NoStoresAvailable)
        ));
    }
}
