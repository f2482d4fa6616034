//! SQLite storage for service definitions
//!
//! Definitions, versions and traffic splits survive restarts here. Env
//! vars and weight lists are stored as JSON columns.

use crate::registry::{
    now_rfc3339, NewVersion, RegistryError, ServiceDefinition, ServiceStore, ServiceVersion,
    TrafficWeight, Weight,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Storage(format!("corrupt JSON column: {}", err))
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RegistryError::Storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Service database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    fn load(
        conn: &Connection,
        column: &str,
        value: &str,
    ) -> Result<Option<ServiceDefinition>, RegistryError> {
        let sql = format!(
            "SELECT id, name, host, active_weight_id, created_at
             FROM service_definitions WHERE {} = ?1",
            column
        );
        let row = conn
            .query_row(&sql, params![value], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;

        match row {
            Some(row) => Ok(Some(Self::assemble(conn, row)?)),
            None => Ok(None),
        }
    }

    fn assemble(
        conn: &Connection,
        (id, name, host, active_weight_id, created_at): (i64, String, String, Option<i64>, String),
    ) -> Result<ServiceDefinition, RegistryError> {
        let mut stmt = conn.prepare(
            "SELECT id, image_name, image_tag, port, env_vars, created_at
             FROM service_versions WHERE service_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u16>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut versions = Vec::new();
        for row in rows {
            let (version_id, image_name, image_tag, port, env_json, created_at) = row?;
            versions.push(ServiceVersion {
                id: version_id as u64,
                service_id: id as u64,
                image_name,
                image_tag,
                port,
                env_vars: serde_json::from_str(&env_json)?,
                created_at,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, weights, created_at
             FROM traffic_weights WHERE service_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut traffic_weights = Vec::new();
        for row in rows {
            let (weight_id, weights_json, created_at) = row?;
            traffic_weights.push(TrafficWeight {
                id: weight_id as u64,
                service_id: id as u64,
                weights: serde_json::from_str(&weights_json)?,
                created_at,
            });
        }

        Ok(ServiceDefinition {
            id: id as u64,
            name,
            host,
            versions,
            traffic_weights,
            active_weight_id: active_weight_id.map(|w| w as u64),
            created_at,
        })
    }

    fn exists(conn: &Connection, column: &str, value: &str) -> Result<bool, RegistryError> {
        let sql = format!("SELECT 1 FROM service_definitions WHERE {} = ?1", column);
        Ok(conn
            .query_row(&sql, params![value], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn require_service(conn: &Connection, service_id: u64) -> Result<(), RegistryError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM service_definitions WHERE id = ?1",
                params![service_id as i64],
                |_| Ok(()),
            )
            .optional()?;
        found.ok_or_else(|| RegistryError::NotFound(format!("id {}", service_id)))
    }
}

/// Migration v1: definitions, versions and traffic splits
fn migrate_v1(conn: &Connection) -> Result<(), RegistryError> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS service_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS service_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id INTEGER NOT NULL,
            image_name TEXT NOT NULL,
            image_tag TEXT NOT NULL,
            port INTEGER NOT NULL,
            env_vars TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            FOREIGN KEY (service_id) REFERENCES service_definitions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS traffic_weights (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id INTEGER NOT NULL,
            weights TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (service_id) REFERENCES service_definitions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_service_versions_service ON service_versions(service_id);
        CREATE INDEX IF NOT EXISTS idx_traffic_weights_service ON traffic_weights(service_id);

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Migration v2: explicit active traffic split
fn migrate_v2(conn: &Connection) -> Result<(), RegistryError> {
    debug!("Applying migration v2: active traffic split");

    conn.execute_batch(
        r#"
        ALTER TABLE service_definitions ADD COLUMN active_weight_id INTEGER
            REFERENCES traffic_weights(id);

        -- Services created before v2 use their newest split
        UPDATE service_definitions SET active_weight_id = (
            SELECT MAX(id) FROM traffic_weights
            WHERE traffic_weights.service_id = service_definitions.id
        );

        INSERT INTO schema_migrations (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

impl ServiceStore for SqliteStore {
    fn list(&self) -> Result<Vec<ServiceDefinition>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, host, active_weight_id, created_at
             FROM service_definitions ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|row| Self::assemble(&conn, row))
            .collect()
    }

    fn by_name(&self, name: &str) -> Result<Option<ServiceDefinition>, RegistryError> {
        Self::load(&self.conn.lock(), "name", name)
    }

    fn by_host(&self, host: &str) -> Result<Option<ServiceDefinition>, RegistryError> {
        Self::load(&self.conn.lock(), "host", host)
    }

    fn create(&self, name: &str, host: &str) -> Result<ServiceDefinition, RegistryError> {
        let conn = self.conn.lock();
        if Self::exists(&conn, "name", name)? {
            return Err(RegistryError::AlreadyExists(format!("service name '{}'", name)));
        }
        if Self::exists(&conn, "host", host)? {
            return Err(RegistryError::AlreadyExists(format!("host '{}'", host)));
        }

        let created_at = now_rfc3339();
        conn.execute(
            "INSERT INTO service_definitions (name, host, created_at) VALUES (?1, ?2, ?3)",
            params![name, host, created_at],
        )?;

        Ok(ServiceDefinition {
            id: conn.last_insert_rowid() as u64,
            name: name.to_string(),
            host: host.to_string(),
            versions: Vec::new(),
            traffic_weights: Vec::new(),
            active_weight_id: None,
            created_at,
        })
    }

    fn add_version(
        &self,
        service_id: u64,
        version: &NewVersion,
    ) -> Result<ServiceVersion, RegistryError> {
        let conn = self.conn.lock();
        Self::require_service(&conn, service_id)?;

        let created_at = now_rfc3339();
        conn.execute(
            "INSERT INTO service_versions
                (service_id, image_name, image_tag, port, env_vars, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                service_id as i64,
                version.image_name,
                version.image_tag,
                version.port,
                serde_json::to_string(&version.env_vars)?,
                created_at,
            ],
        )?;

        Ok(ServiceVersion {
            id: conn.last_insert_rowid() as u64,
            service_id,
            image_name: version.image_name.clone(),
            image_tag: version.image_tag.clone(),
            port: version.port,
            env_vars: version.env_vars.clone(),
            created_at,
        })
    }

    fn add_traffic_weight(
        &self,
        service_id: u64,
        weights: &[Weight],
    ) -> Result<TrafficWeight, RegistryError> {
        let mut conn = self.conn.lock();
        Self::require_service(&conn, service_id)?;

        let created_at = now_rfc3339();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO traffic_weights (service_id, weights, created_at) VALUES (?1, ?2, ?3)",
            params![service_id as i64, serde_json::to_string(weights)?, created_at],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE service_definitions SET active_weight_id = ?1 WHERE id = ?2",
            params![id, service_id as i64],
        )?;
        tx.commit()?;

        Ok(TrafficWeight {
            id: id as u64,
            service_id,
            weights: weights.to_vec(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(tag: &str) -> NewVersion {
        NewVersion {
            image_name: "hello".to_string(),
            image_tag: tag.to_string(),
            port: 8080,
            env_vars: vec!["MODE=test".to_string(), "EMPTY=".to_string()],
        }
    }

    #[test]
    fn test_create_and_get_service() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create("web", "web.local").unwrap();

        let by_name = store.by_name("web").unwrap().unwrap();
        assert_eq!(by_name, created);
        let by_host = store.by_host("web.local").unwrap().unwrap();
        assert_eq!(by_host.id, created.id);

        assert!(store.by_name("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_and_host() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create("web", "web.local").unwrap();

        assert!(matches!(
            store.create("web", "other.local").unwrap_err(),
            RegistryError::AlreadyExists(_)
        ));
        assert!(matches!(
            store.create("api", "web.local").unwrap_err(),
            RegistryError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_versions_and_active_weight() {
        let store = SqliteStore::open_in_memory().unwrap();
        let svc = store.create("web", "web.local").unwrap();
        let v1 = store.add_version(svc.id, &version("v1")).unwrap();
        let v2 = store.add_version(svc.id, &version("v2")).unwrap();

        store
            .add_traffic_weight(svc.id, &[Weight { version_id: v1.id, weight: 100 }])
            .unwrap();
        let split = store
            .add_traffic_weight(
                svc.id,
                &[
                    Weight { version_id: v1.id, weight: 50 },
                    Weight { version_id: v2.id, weight: 50 },
                ],
            )
            .unwrap();

        let loaded = store.by_host("web.local").unwrap().unwrap();
        assert_eq!(loaded.versions, vec![v1, v2]);
        assert_eq!(loaded.versions[0].env_vars, vec!["MODE=test", "EMPTY="]);
        assert_eq!(loaded.traffic_weights.len(), 2);
        assert_eq!(loaded.active_weights(), Some(&split));
    }

    #[test]
    fn test_unknown_service_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.add_version(42, &version("v1")).unwrap_err(),
            RegistryError::NotFound(_)
        ));
        assert!(matches!(
            store.add_traffic_weight(42, &[]).unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }

    #[test]
    fn test_list_in_creation_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.create(&format!("svc{}", i), &format!("svc{}.local", i)).unwrap();
        }
        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["svc0", "svc1", "svc2"]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("services.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            let svc = store.create("web", "web.local").unwrap();
            let v1 = store.add_version(svc.id, &version("v1")).unwrap();
            store
                .add_traffic_weight(svc.id, &[Weight { version_id: v1.id, weight: 100 }])
                .unwrap();
            svc.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let svc = store.by_name("web").unwrap().unwrap();
        assert_eq!(svc.id, id);
        assert_eq!(svc.versions.len(), 1);
        assert!(svc.active_weights().is_some());
    }
}
