use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use store_directory_core::types::normalize_slug;
use store_directory_core::{
    AncestorStep, AncestorWalk, DescendantWalk, DirectoryError, Domains, NewStore, Store, StoreId,
    StoreParts, StoreUpdate,
};

use crate::to_rfc3339;

/// Expands to a `SELECT` over every store column followed by `$tail`.
macro_rules! select_stores {
    ($tail:literal) => {
        concat!(
            "SELECT id, slug, domains, is_default, parent_id, create_your_own_link, created_at, updated_at \
             FROM stores ",
            $tail
        )
    };
}

/// Errors raised by [`StoreRepository`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Returns the directory level error, if this is one.
    pub fn as_directory(&self) -> Option<&DirectoryError> {
        match self {
            Self::Directory(err) => Some(err),
            Self::Database(_) => None,
        }
    }
}

/// Repository holding the persisted store directory.
///
/// Every mutation runs in one transaction while holding the writer gate shared
/// with the owning [`crate::Database`], and the first statement of each such
/// transaction is a write. Reads go straight to the pool.
#[derive(Clone)]
pub struct StoreRepository {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl StoreRepository {
    pub(crate) fn new(pool: SqlitePool, write_gate: Arc<Mutex<()>>) -> Self {
        Self { pool, write_gate }
    }

    /// Inserts a new store.
    ///
    /// A store created with `default` set takes the flag from every other
    /// store; one created while no store is flagged becomes the default.
    pub async fn create(&self, new: NewStore) -> Result<Store, StoreError> {
        if normalize_slug(&new.slug).is_none() {
            return Err(DirectoryError::InvalidSlug.into());
        }

        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = insert_store(&mut tx, new).await;
        let store = finish(tx, outcome).await?;

        debug!(stage = "storage", store_id = %store.id(), slug = store.slug(), default = store.is_default(), "store created");
        Ok(store)
    }

    /// Applies a partial update. The default flag is not part of it.
    pub async fn update(&self, id: &StoreId, update: StoreUpdate) -> Result<Store, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = update_store(&mut tx, id, update).await;
        finish(tx, outcome).await
    }

    /// Removes a store. Children keep their (now dangling) parent reference.
    pub async fn delete(&self, id: &StoreId) -> Result<Store, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = delete_store(&mut tx, id).await;
        let removed = finish(tx, outcome).await?;

        if removed.is_default() {
            info!(stage = "storage", store_id = %id, "default store deleted; next lookup elects a replacement");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: &StoreId) -> Result<Option<Store>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_in(&mut conn, id).await?)
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Store>, StoreError> {
        let row = sqlx::query_as::<_, StoreRow>(select_stores!("WHERE slug = ?"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StoreRow::into_domain))
    }

    /// All stores in creation order.
    pub async fn list(&self) -> Result<Vec<Store>, StoreError> {
        let rows = sqlx::query_as::<_, StoreRow>(select_stores!("ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(StoreRow::into_domain).collect())
    }

    /// Stores listing `hostname` among their domains, in creation order.
    pub async fn find_by_domain(&self, hostname: &str) -> Result<Vec<Store>, StoreError> {
        let rows = sqlx::query_as::<_, StoreRow>(
            "SELECT s.id, s.slug, s.domains, s.is_default, s.parent_id, s.create_your_own_link, \
                    s.created_at, s.updated_at \
               FROM stores AS s \
               JOIN store_domains AS d ON d.store_id = s.id \
              WHERE d.domain = ? \
              ORDER BY s.seq",
        )
        .bind(hostname)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoreRow::into_domain).collect())
    }

    /// Returns the default store, electing one first when the flags are off.
    ///
    /// With exactly one store flagged this is a plain read. Otherwise it falls
    /// through to [`Self::elect_default`], which writes.
    pub async fn get_default(&self) -> Result<Store, StoreError> {
        let mut flagged = sqlx::query_as::<_, StoreRow>(select_stores!(
            "WHERE is_default = 1 ORDER BY seq LIMIT 2"
        ))
        .fetch_all(&self.pool)
        .await?;

        if flagged.len() == 1 {
            if let Some(row) = flagged.pop() {
                return Ok(row.into_domain());
            }
        }

        self.elect_default().await
    }

    /// Default election fallback.
    ///
    /// Keeps the earliest-created flagged store, or promotes the
    /// earliest-created store when none is flagged, and clears every other
    /// flag. The new flags are committed before returning.
    pub async fn elect_default(&self) -> Result<Store, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = elect_default_in(&mut tx).await;
        let (store, election) = finish(tx, outcome).await?;

        if election.promoted {
            info!(stage = "storage", store_id = %store.id(), slug = store.slug(), "no default store flagged; promoted earliest store");
        }
        if election.cleared > 0 {
            warn!(stage = "storage", store_id = %store.id(), cleared = election.cleared, "several default stores flagged; kept earliest");
        }
        Ok(store)
    }

    /// Flags `id` as the default and clears the flag everywhere else.
    pub async fn set_default(&self, id: &StoreId) -> Result<Store, StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = set_default_in(&mut tx, id).await;
        let store = finish(tx, outcome).await?;

        info!(stage = "storage", store_id = %id, "default store changed");
        Ok(store)
    }

    /// Direct children in creation order.
    pub async fn children(&self, id: &StoreId) -> Result<Vec<Store>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(children_in(&mut conn, id).await?)
    }

    /// Every descendant of `id`, depth-first with parents before their children.
    pub async fn all_children(&self, id: &StoreId) -> Result<Vec<Store>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut walk = DescendantWalk::new(id);
        while let Some(parent) = walk.next_parent() {
            walk.expand(children_in(&mut conn, &parent).await?);
        }

        if !walk.revisited().is_empty() {
            warn!(stage = "storage", store_id = %id, revisited = ?walk.revisited(), "cycle in store hierarchy; traversal cut short");
        }
        Ok(walk.finish())
    }

    /// Path from `id` up to and including `ancestor`, nearest first.
    ///
    /// Empty when `ancestor` is not on the parent chain of `id`.
    pub async fn up_to(&self, id: &StoreId, ancestor: &StoreId) -> Result<Vec<Store>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let path = match walk_up(&mut conn, id, ancestor).await? {
            AncestorStep::Reached(path) => path,
            AncestorStep::Cycle(at) => {
                warn!(stage = "storage", store_id = %id, cycle_at = %at, "cycle in store hierarchy; no path returned");
                Vec::new()
            }
            _ => Vec::new(),
        };
        Ok(path)
    }
}

/// Commits on success and rolls back on failure, waiting for either to land.
async fn finish<T>(
    tx: Transaction<'_, Sqlite>,
    outcome: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

async fn insert_store(conn: &mut SqliteConnection, new: NewStore) -> Result<Store, StoreError> {
    let parts = new.into_store(Utc::now()).into_parts();
    let at = to_rfc3339(parts.created_at);

    sqlx::query(
        "INSERT INTO stores \
         (id, slug, domains, is_default, parent_id, create_your_own_link, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(parts.id.as_str())
    .bind(&parts.slug)
    .bind(parts.domains.to_blob())
    .bind(i64::from(parts.is_default))
    .bind(parts.parent_id.as_ref().map(StoreId::as_str))
    .bind(parts.create_your_own_link.as_deref())
    .bind(&at)
    .bind(&at)
    .execute(&mut *conn)
    .await
    .map_err(|err| unique_violation(err, &parts.slug))?;

    if let Some(parent) = &parts.parent_id {
        if fetch_in(conn, parent).await?.is_none() {
            return Err(DirectoryError::ParentNotFound(parent.clone()).into());
        }
    }

    if parts.is_default {
        sqlx::query("UPDATE stores SET is_default = 0, updated_at = ? WHERE is_default = 1 AND id != ?")
            .bind(&at)
            .bind(parts.id.as_str())
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query(
            "UPDATE stores SET is_default = 1 \
             WHERE id = ? AND NOT EXISTS (SELECT 1 FROM stores WHERE is_default = 1)",
        )
        .bind(parts.id.as_str())
        .execute(&mut *conn)
        .await?;
    }

    replace_domains(conn, &parts.id, &parts.domains).await?;

    let store = fetch_in(conn, &parts.id)
        .await?
        .ok_or_else(|| DirectoryError::StoreNotFound(parts.id.clone()))?;
    Ok(store)
}

async fn update_store(
    conn: &mut SqliteConnection,
    id: &StoreId,
    update: StoreUpdate,
) -> Result<Store, StoreError> {
    let at = to_rfc3339(Utc::now());
    let touched = sqlx::query("UPDATE stores SET updated_at = ? WHERE id = ?")
        .bind(&at)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(DirectoryError::StoreNotFound(id.clone()).into());
    }

    if let Some(slug) = &update.slug {
        let slug = normalize_slug(slug).ok_or(DirectoryError::InvalidSlug)?;
        sqlx::query("UPDATE stores SET slug = ? WHERE id = ?")
            .bind(slug)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|err| unique_violation(err, slug))?;
    }

    if let Some(parent) = &update.parent_id {
        if let Some(parent) = parent {
            if fetch_in(conn, parent).await?.is_none() {
                return Err(DirectoryError::ParentNotFound(parent.clone()).into());
            }
            if let AncestorStep::Reached(_) = walk_up(conn, parent, id).await? {
                return Err(DirectoryError::CyclicParent {
                    store: id.clone(),
                    parent: parent.clone(),
                }
                .into());
            }
        }
        sqlx::query("UPDATE stores SET parent_id = ? WHERE id = ?")
            .bind(parent.as_ref().map(StoreId::as_str))
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
    }

    if let Some(domains) = &update.domains {
        sqlx::query("UPDATE stores SET domains = ? WHERE id = ?")
            .bind(domains.to_blob())
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
        replace_domains(conn, id, domains).await?;
    }

    if let Some(link) = &update.create_your_own_link {
        sqlx::query("UPDATE stores SET create_your_own_link = ? WHERE id = ?")
            .bind(link.as_deref())
            .bind(id.as_str())
            .execute(&mut *conn)
            .await?;
    }

    let store = fetch_in(conn, id)
        .await?
        .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;
    Ok(store)
}

async fn delete_store(conn: &mut SqliteConnection, id: &StoreId) -> Result<Store, StoreError> {
    let removed = sqlx::query_as::<_, StoreRow>(
        "DELETE FROM stores WHERE id = ? \
         RETURNING id, slug, domains, is_default, parent_id, create_your_own_link, created_at, updated_at",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?
    .map(StoreRow::into_domain)
    .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;

    sqlx::query("DELETE FROM store_domains WHERE store_id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}

/// Flag changes made by one default election.
#[derive(Debug, Default, Clone, Copy)]
struct Election {
    promoted: bool,
    cleared: usize,
}

async fn elect_default_in(conn: &mut SqliteConnection) -> Result<(Store, Election), StoreError> {
    let at = to_rfc3339(Utc::now());
    let changed: Vec<(i64,)> = sqlx::query_as(
        "WITH elected AS (SELECT id FROM stores ORDER BY is_default DESC, seq ASC LIMIT 1) \
         UPDATE stores \
            SET is_default = (id IN (SELECT id FROM elected)), \
                updated_at = ? \
          WHERE is_default != (id IN (SELECT id FROM elected)) \
         RETURNING is_default",
    )
    .bind(&at)
    .fetch_all(&mut *conn)
    .await?;

    let election = changed
        .iter()
        .fold(Election::default(), |mut election, (flag,)| {
            if *flag != 0 {
                election.promoted = true;
            } else {
                election.cleared += 1;
            }
            election
        });

    let store = sqlx::query_as::<_, StoreRow>(select_stores!(
        "WHERE is_default = 1 ORDER BY seq LIMIT 1"
    ))
    .fetch_optional(&mut *conn)
    .await?
    .map(StoreRow::into_domain)
    .ok_or(DirectoryError::NoStoresAvailable)?;
    Ok((store, election))
}

async fn set_default_in(conn: &mut SqliteConnection, id: &StoreId) -> Result<Store, StoreError> {
    let at = to_rfc3339(Utc::now());
    let promoted = sqlx::query("UPDATE stores SET is_default = 1, updated_at = ? WHERE id = ?")
        .bind(&at)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if promoted == 0 {
        return Err(DirectoryError::StoreNotFound(id.clone()).into());
    }

    sqlx::query("UPDATE stores SET is_default = 0, updated_at = ? WHERE is_default = 1 AND id != ?")
        .bind(&at)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    let store = fetch_in(conn, id)
        .await?
        .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;
    Ok(store)
}

async fn fetch_in(conn: &mut SqliteConnection, id: &StoreId) -> Result<Option<Store>, sqlx::Error> {
    let row = sqlx::query_as::<_, StoreRow>(select_stores!("WHERE id = ?"))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(StoreRow::into_domain))
}

async fn children_in(conn: &mut SqliteConnection, id: &StoreId) -> Result<Vec<Store>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StoreRow>(select_stores!("WHERE parent_id = ? ORDER BY seq"))
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(StoreRow::into_domain).collect())
}

async fn walk_up(
    conn: &mut SqliteConnection,
    id: &StoreId,
    ancestor: &StoreId,
) -> Result<AncestorStep, sqlx::Error> {
    let mut walk = AncestorWalk::new(ancestor);
    let mut step = walk.visit(fetch_in(conn, id).await?);
    while let AncestorStep::Fetch(next) = step {
        step = walk.visit(fetch_in(conn, &next).await?);
    }
    Ok(step)
}

async fn replace_domains(
    conn: &mut SqliteConnection,
    id: &StoreId,
    domains: &Domains,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM store_domains WHERE store_id = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;

    // Index exactly what the persisted blob reads back as.
    let persisted = Domains::parse(&domains.to_blob());
    for domain in persisted.iter() {
        sqlx::query("INSERT OR IGNORE INTO store_domains (store_id, domain) VALUES (?, ?)")
            .bind(id.as_str())
            .bind(domain)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn unique_violation(err: sqlx::Error, slug: &str) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("2067") => {
            DirectoryError::DuplicateSlug(slug.to_string()).into()
        }
        other => StoreError::Database(other),
    }
}

/// Row shape of the `stores` table.
#[derive(Debug, sqlx::FromRow)]
struct StoreRow {
    id: String,
    slug: String,
    domains: String,
    is_default: i64,
    parent_id: Option<String>,
    create_your_own_link: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StoreRow {
    fn into_domain(self) -> Store {
        Store::from(StoreParts {
            id: StoreId::from(self.id),
            slug: self.slug,
            domains: Domains::parse(&self.domains),
            is_default: self.is_default != 0,
            parent_id: self.parent_id.map(StoreId::from),
            create_your_own_link: self.create_your_own_link,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::Database;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    async fn create(repo: &StoreRepository, new: NewStore) -> Store {
        repo.create(new).await.expect("create store")
    }

    async fn flagged(repo: &StoreRepository) -> Vec<String> {
        repo.list()
            .await
            .expect("list")
            .into_iter()
            .filter(Store::is_default)
            .map(|store| store.slug().to_string())
            .collect()
    }

    fn slugs(stores: &[Store]) -> Vec<&str> {
        stores.iter().map(Store::slug).collect()
    }

    struct Tree {
        top: Store,
        one: Store,
        two: Store,
        gc1: Store,
        gc2: Store,
        ogc: Store,
        ugc: Store,
    }

    async fn build_tree(repo: &StoreRepository) -> Tree {
        let top = create(repo, NewStore::new("top")).await;
        let one = create(repo, NewStore::new("one").with_parent(top.id())).await;
        let two = create(repo, NewStore::new("two").with_parent(top.id())).await;
        let gc1 = create(repo, NewStore::new("gc1").with_parent(one.id())).await;
        let gc2 = create(repo, NewStore::new("gc2").with_parent(one.id())).await;
        let ogc = create(repo, NewStore::new("ogc").with_parent(two.id())).await;
        let ugc = create(repo, NewStore::new("ugc").with_parent(gc2.id())).await;
        Tree {
            top,
            one,
            two,
            gc1,
            gc2,
            ogc,
            ugc,
        }
    }

    async fn insert_raw(db: &Database, id: &str, parent: Option<&str>, default: bool) {
        sqlx::query(
            "INSERT INTO stores (id, slug, domains, is_default, parent_id, created_at, updated_at) \
             VALUES (?, ?, '', ?, ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .bind(id)
        .bind(id)
        .bind(i64::from(default))
        .bind(parent)
        .execute(db.pool())
        .await
        .expect("insert raw store");
    }

    #[tokio::test]
    async fn finds_stores_by_domain() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(
            &repo,
            NewStore::new("store-1").with_domains("website1.com\nwww.subdomain.com"),
        )
        .await;
        let store_2 = create(&repo, NewStore::new("store-2").with_domains("freethewhales.com")).await;

        let by_domain = repo.find_by_domain("www.subdomain.com").await.expect("lookup");
        assert!(by_domain.iter().any(|found| found.id() == store.id()));
        assert!(!by_domain.iter().any(|found| found.id() == store_2.id()));
        assert!(repo.find_by_domain("unknown.example").await.expect("lookup").is_empty());
    }

    #[tokio::test]
    async fn domains_blob_round_trips_through_storage() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(&repo, NewStore::new("store-1").with_domains("a.example\r\nb.example\n")).await;

        let raw: (String,) = sqlx::query_as("SELECT domains FROM stores WHERE id = ?")
            .bind(store.id().as_str())
            .fetch_one(db.pool())
            .await
            .expect("raw domains");
        assert_eq!(raw.0, "a.example\nb.example");
        assert_eq!(repo.find_by_domain("b.example").await.expect("lookup").len(), 1);
    }

    #[tokio::test]
    async fn collected_domains_are_indexed_as_persisted() {
        let db = setup_db().await;
        let repo = db.stores();
        let domains: Domains = ["shop.example ", "a.example\nb.example"].into_iter().collect();
        let store = create(&repo, NewStore::new("store-1").with_domains(domains)).await;

        let stored = repo.get(store.id()).await.expect("get").expect("store-1");
        for host in ["shop.example", "a.example", "b.example"] {
            assert!(stored.domains().contains(host), "{host} listed");
            let found = repo.find_by_domain(host).await.expect("lookup");
            assert_eq!(slugs(&found), vec!["store-1"], "{host} indexed");
        }
        assert!(repo.find_by_domain("shop.example ").await.expect("lookup").is_empty());

        let update = StoreUpdate {
            domains: Some(["c.example\r\n", " d.example"].into_iter().collect()),
            ..StoreUpdate::default()
        };
        repo.update(store.id(), update).await.expect("update");
        assert!(repo.find_by_domain("shop.example").await.expect("lookup").is_empty());
        assert_eq!(repo.find_by_domain("c.example").await.expect("lookup").len(), 1);
        assert_eq!(repo.find_by_domain("d.example").await.expect("lookup").len(), 1);
    }

    #[tokio::test]
    async fn updating_domains_reindexes_lookups() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(&repo, NewStore::new("store-1").with_domains("old.example")).await;

        let update = StoreUpdate {
            domains: Some(Domains::parse("new.example")),
            ..StoreUpdate::default()
        };
        repo.update(store.id(), update).await.expect("update");

        assert!(repo.find_by_domain("old.example").await.expect("lookup").is_empty());
        assert_eq!(repo.find_by_domain("new.example").await.expect("lookup").len(), 1);
    }

    #[tokio::test]
    async fn first_store_becomes_default() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(&repo, NewStore::new("store-1")).await;
        assert!(store.is_default());
        assert_eq!(repo.get_default().await.expect("default").id(), store.id());
    }

    #[tokio::test]
    async fn explicit_default_takes_the_flag() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(&repo, NewStore::new("store-1")).await;
        let store_2 = create(&repo, NewStore::new("store-2").as_default()).await;

        let default = repo.get_default().await.expect("default");
        assert_eq!(default.id(), store_2.id());
        assert_eq!(flagged(&repo).await, vec!["store-2"]);
        let store = repo.get(store.id()).await.expect("get").expect("store-1");
        assert!(!store.is_default());
    }

    #[tokio::test]
    async fn set_default_moves_the_flag() {
        let db = setup_db().await;
        let repo = db.stores();
        create(&repo, NewStore::new("store-1")).await;
        let store_2 = create(&repo, NewStore::new("store-2")).await;

        let updated = repo.set_default(store_2.id()).await.expect("set default");
        assert!(updated.is_default());
        assert_eq!(flagged(&repo).await, vec!["store-2"]);

        let err = repo
            .set_default(&StoreId::from("missing"))
            .await
            .expect_err("unknown id");
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::StoreNotFound(_))
        ));
        assert_eq!(flagged(&repo).await, vec!["store-2"]);
    }

    #[tokio::test]
    async fn empty_directory_has_no_default() {
        let db = setup_db().await;
        let err = db.stores().get_default().await.expect_err("empty");
        assert!(matches!(
            err,
            StoreError::Directory(DirectoryError::NoStoresAvailable)
        ));
    }

    #[tokio::test]
    async fn deleting_default_elects_earliest_remaining() {
        let db = setup_db().await;
        let repo = db.stores();
        let first = create(&repo, NewStore::new("first")).await;
        create(&repo, NewStore::new("second")).await;
        let third = create(&repo, NewStore::new("third").as_default()).await;

        let removed = repo.delete(third.id()).await.expect("delete");
        assert!(removed.is_default());
        assert!(flagged(&repo).await.is_empty());

        let default = repo.get_default().await.expect("default");
        assert_eq!(default.id(), first.id());
        assert_eq!(flagged(&repo).await, vec!["first"]);
    }

    #[tokio::test]
    async fn several_flagged_defaults_collapse_to_earliest() {
        let db = setup_db().await;
        insert_raw(&db, "a", None, false).await;
        insert_raw(&db, "b", None, true).await;
        insert_raw(&db, "c", None, true).await;
        let repo = db.stores();

        let default = repo.get_default().await.expect("default");
        assert_eq!(default.slug(), "b");
        assert_eq!(flagged(&repo).await, vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_default_leaves_one_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}/stores.db?mode=rwc", dir.path().display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        let repo = db.stores();

        let mut ids = Vec::new();
        for index in 0..6 {
            ids.push(create(&repo, NewStore::new(format!("store-{index}"))).await.id().clone());
        }

        let mut handles = Vec::new();
        for id in ids.iter().cloned() {
            let repo = db.stores();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    repo.set_default(&id).await.expect("set default");
                    repo.get_default().await.expect("default");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(flagged(&repo).await.len(), 1);
        let default = repo.get_default().await.expect("default");
        assert!(ids.contains(default.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_elect_one_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}/stores.db?mode=rwc", dir.path().display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        insert_raw(&db, "first", None, false).await;
        insert_raw(&db, "second", None, false).await;
        insert_raw(&db, "third", None, false).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = db.stores();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                repo.get_default().await.expect("default")
            }));
        }
        for handle in handles {
            let default = handle.await.expect("task");
            assert_eq!(default.slug(), "first");
            assert!(default.is_default());
        }

        assert_eq!(flagged(&db.stores()).await, vec!["first"]);
    }

    #[tokio::test]
    async fn all_children_returns_every_descendant() {
        let db = setup_db().await;
        let repo = db.stores();
        let tree = build_tree(&repo).await;

        let all_children = repo.all_children(tree.top.id()).await.expect("children");
        let expected: HashSet<_> = [&tree.one, &tree.two, &tree.gc1, &tree.gc2, &tree.ogc, &tree.ugc]
            .iter()
            .map(|store| store.id().clone())
            .collect();
        let found: HashSet<_> = all_children.iter().map(|store| store.id().clone()).collect();
        assert_eq!(found, expected);
        assert_eq!(all_children.len(), expected.len());
        assert_eq!(slugs(&all_children), vec!["one", "gc1", "gc2", "ugc", "two", "ogc"]);

        assert!(repo.all_children(tree.ugc.id()).await.expect("leaf").is_empty());
        assert_eq!(
            slugs(&repo.children(tree.one.id()).await.expect("children")),
            vec!["gc1", "gc2"]
        );
    }

    #[tokio::test]
    async fn up_to_walks_the_parent_chain() {
        let db = setup_db().await;
        let repo = db.stores();
        let tree = build_tree(&repo).await;

        let path = repo.up_to(tree.ugc.id(), tree.top.id()).await.expect("path");
        assert_eq!(slugs(&path), vec!["ugc", "gc2", "one", "top"]);

        assert!(repo
            .up_to(tree.top.id(), tree.one.id())
            .await
            .expect("wrong direction")
            .is_empty());

        let own = repo.up_to(tree.top.id(), tree.top.id()).await.expect("self");
        assert_eq!(slugs(&own), vec!["top"]);
    }

    #[tokio::test]
    async fn deleted_parent_leaves_children_dangling() {
        let db = setup_db().await;
        let repo = db.stores();
        let tree = build_tree(&repo).await;

        repo.delete(tree.gc2.id()).await.expect("delete");
        let ugc = repo.get(tree.ugc.id()).await.expect("get").expect("ugc survives");
        assert_eq!(ugc.parent_id(), Some(tree.gc2.id()));
        assert!(repo
            .up_to(tree.ugc.id(), tree.top.id())
            .await
            .expect("path")
            .is_empty());
        assert_eq!(
            slugs(&repo.all_children(tree.top.id()).await.expect("children")),
            vec!["one", "gc1", "two", "ogc"]
        );
    }

    #[tokio::test]
    async fn rejects_cyclic_and_unknown_parents() {
        let db = setup_db().await;
        let repo = db.stores();
        let tree = build_tree(&repo).await;

        let cyclic = StoreUpdate {
            parent_id: Some(Some(tree.ugc.id().clone())),
            ..StoreUpdate::default()
        };
        let err = repo.update(tree.one.id(), cyclic).await.expect_err("cycle");
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::CyclicParent { .. })
        ));
        let one = repo.get(tree.one.id()).await.expect("get").expect("one");
        assert_eq!(one.parent_id(), Some(tree.top.id()));

        let err = repo
            .create(NewStore::new("orphan").with_parent(&StoreId::from("ghost")))
            .await
            .expect_err("unknown parent");
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::ParentNotFound(_))
        ));
        assert!(repo.get_by_slug("orphan").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn imported_cycle_does_not_hang_traversal() {
        let db = setup_db().await;
        insert_raw(&db, "a", Some("b"), true).await;
        insert_raw(&db, "b", Some("a"), false).await;
        insert_raw(&db, "c", None, false).await;
        let repo = db.stores();

        let children = repo.all_children(&StoreId::from("a")).await.expect("children");
        assert_eq!(slugs(&children), vec!["b"]);
        assert!(repo
            .up_to(&StoreId::from("a"), &StoreId::from("c"))
            .await
            .expect("path")
            .is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_slugs() {
        let db = setup_db().await;
        let repo = db.stores();
        create(&repo, NewStore::new("store-1")).await;
        let store_2 = create(&repo, NewStore::new("store-2")).await;

        let err = repo.create(NewStore::new("store-1")).await.expect_err("duplicate");
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::DuplicateSlug(slug)) if slug == "store-1"
        ));

        let rename = StoreUpdate {
            slug: Some("store-1".to_string()),
            ..StoreUpdate::default()
        };
        let err = repo.update(store_2.id(), rename).await.expect_err("duplicate");
        assert!(matches!(
            err.as_directory(),
            Some(DirectoryError::DuplicateSlug(_))
        ));
    }

    #[tokio::test]
    async fn unset_link_reads_empty() {
        let db = setup_db().await;
        let repo = db.stores();
        let store = create(&repo, NewStore::new("store").with_create_your_own_link(None)).await;
        assert_eq!(store.create_your_own_link(), "");

        let update = StoreUpdate {
            create_your_own_link: Some(Some("https://example.com/build".to_string())),
            ..StoreUpdate::default()
        };
        let updated = repo.update(store.id(), update).await.expect("update");
        assert_eq!(updated.create_your_own_link(), "https://example.com/build");
    }
}
