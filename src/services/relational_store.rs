//! SQLite store of record for the CMDB.
//!
//! Owns every durable record: configuration items, relationships, users,
//! roles, attribute schemas, sync events, conflicts, alerts, fallback
//! operations, audit entries and pipeline stats. Change capture runs inside
//! the same transaction as the originating write, so a committed change and
//! its sync event are inseparable: if the event insert fails, the write
//! aborts.

use crate::error::{Result, SyncError};
use crate::types::{
    Alert, AlertSeverity, AttributeSchema, AuditEntry, CiFilter, ConfigurationItem,
    ConflictRecord, ConflictStrategy, ConflictType, EntityType, EventStatus, FallbackOperation,
    FallbackStatus, FallbackStrategy, FullResyncStatus, Page, QueueDepths, Relationship,
    ResyncReport, Role, SchemaDefinition, SyncAction, SyncEvent, SyncLogEntry, SyncStats, User,
    UserRole,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Relationship types that must stay acyclic. `DEPENDS_ON` is acyclic by
/// default; others are free-form.
const ACYCLIC_REL_TYPES: &[&str] = &["DEPENDS_ON"];

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SQLite store of record.
pub struct RelationalStore {
    conn: Mutex<Connection>,
    pub db_path: String,
}

impl RelationalStore {
    /// Open (or create) the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.init_schema()?;
        info!("Relational store initialized at {}", store.db_path);
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: ":memory:".to_string(),
        };
        store.init_schema()?;
        debug!("In-memory relational store initialized");
        Ok(store)
    }

    /// Create tables and indexes. All statements are idempotent.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS configuration_items (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                ci_type TEXT NOT NULL,
                attributes_json TEXT NOT NULL DEFAULT '{}',
                tags_json TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                UNIQUE (name, ci_type)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ci_type ON configuration_items(ci_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ci_updated_at ON configuration_items(updated_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                rel_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                attributes_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                FOREIGN KEY (source_id) REFERENCES configuration_items(id),
                FOREIGN KEY (target_id) REFERENCES configuration_items(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rel_source ON relationships(source_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rel_target ON relationships(target_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rel_updated_at ON relationships(updated_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_roles (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                assigned_at INTEGER NOT NULL,
                assigned_by TEXT NOT NULL,
                UNIQUE (user_id, role_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (role_id) REFERENCES roles(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ci_type_schemas (
                target_type TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                strict INTEGER NOT NULL DEFAULT 0,
                attributes_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS relationship_type_schemas (
                target_type TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                strict INTEGER NOT NULL DEFAULT 0,
                attributes_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_events (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                seq INTEGER NOT NULL,
                claimed_by TEXT,
                claimed_at INTEGER,
                retry_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                processed_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_status_created
             ON sync_events(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_entity
             ON sync_events(entity_type, entity_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_failed_retries
             ON sync_events(retry_count) WHERE status = 'FAILED'",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_log (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                worker TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                detail TEXT,
                logged_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_log_logged_at ON sync_log(logged_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                events_processed INTEGER NOT NULL DEFAULT 0,
                events_failed INTEGER NOT NULL DEFAULT 0,
                conflicts_detected INTEGER NOT NULL DEFAULT 0,
                conflicts_resolved INTEGER NOT NULL DEFAULT 0,
                full_resyncs INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_stats (id, updated_at) VALUES (1, 0)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                conflict_type TEXT NOT NULL,
                relational_snapshot TEXT NOT NULL,
                graph_snapshot TEXT NOT NULL,
                strategy TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_by TEXT,
                resolved_at INTEGER,
                detected_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        // Singleton unresolved conflict per entity.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_unresolved
             ON sync_conflicts(entity_type, entity_id) WHERE resolved = 0",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_alerts (
                id TEXT PRIMARY KEY,
                severity TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at INTEGER,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_alerts_active
             ON sync_alerts(severity, alert_type) WHERE resolved = 0",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_fallback_operations (
                id TEXT PRIMARY KEY,
                original_event_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fallback_status
             ON sync_fallback_operations(status, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_fallback_log (
                id TEXT PRIMARY KEY,
                operation_id TEXT NOT NULL,
                message TEXT NOT NULL,
                logged_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_full_resync_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                in_progress INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                completed_at INTEGER,
                report_json TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_logs (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                changed_at INTEGER NOT NULL,
                details TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_entity
             ON audit_logs(entity_type, entity_id)",
            [],
        )?;

        Ok(())
    }

    // ========== Change capture (inside the caller's transaction) ==========

    /// Insert one sync event for a committed change. Runs on the write
    /// transaction so capture and write commit or abort together.
    fn capture_event(
        tx: &Transaction<'_>,
        entity_type: EntityType,
        entity_id: Uuid,
        action: SyncAction,
        payload: Value,
    ) -> Result<SyncEvent> {
        let now = now_ms();
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM sync_events",
            [],
            |row| row.get(0),
        )?;
        let event = SyncEvent {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            action,
            payload,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            seq,
            claimed_by: None,
            claimed_at: None,
            retry_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        tx.execute(
            "INSERT INTO sync_events
             (id, entity_type, entity_id, action, payload, status, retry_count,
              seq, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?7, ?7)",
            params![
                event.id.to_string(),
                entity_type.as_str(),
                entity_id.to_string(),
                action.as_str(),
                serde_json::to_string(&event.payload)?,
                seq,
                now,
            ],
        )?;
        Ok(event)
    }

    fn append_audit(
        tx: &Transaction<'_>,
        entity_type: EntityType,
        entity_id: Uuid,
        action: SyncAction,
        actor_id: Uuid,
        details: Value,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO audit_logs (id, entity_type, entity_id, action, changed_by, changed_at, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                entity_type.as_str(),
                entity_id.to_string(),
                action.as_str(),
                actor_id.to_string(),
                now_ms(),
                serde_json::to_string(&details)?,
            ],
        )?;
        Ok(())
    }

    // ========== Configuration items ==========

    /// Insert a CI, its audit entry and its sync event atomically.
    pub fn create_ci(&self, ci: &ConfigurationItem) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT id FROM configuration_items WHERE name = ?1 AND ci_type = ?2",
                params![ci.name, ci.ci_type],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(SyncError::InvalidRequest(format!(
                "a {} named '{}' already exists",
                ci.ci_type, ci.name
            )));
        }

        tx.execute(
            "INSERT INTO configuration_items
             (id, name, ci_type, attributes_json, tags_json, created_at, updated_at, created_by, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ci.id.to_string(),
                ci.name,
                ci.ci_type,
                serde_json::to_string(&ci.attributes)?,
                serde_json::to_string(&ci.tags)?,
                ci.created_at,
                ci.updated_at,
                ci.created_by.to_string(),
                ci.updated_by.to_string(),
            ],
        )?;

        let payload = serde_json::to_value(ci)?;
        Self::append_audit(
            &tx,
            EntityType::ConfigurationItem,
            ci.id,
            SyncAction::Create,
            ci.created_by,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::ConfigurationItem,
            ci.id,
            SyncAction::Create,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    /// Overwrite a CI row atomically with audit and capture.
    pub fn update_ci(&self, ci: &ConfigurationItem) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let clash: Option<String> = tx
            .query_row(
                "SELECT id FROM configuration_items
                 WHERE name = ?1 AND ci_type = ?2 AND id != ?3",
                params![ci.name, ci.ci_type, ci.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(SyncError::InvalidRequest(format!(
                "a {} named '{}' already exists",
                ci.ci_type, ci.name
            )));
        }

        let changed = tx.execute(
            "UPDATE configuration_items
             SET name = ?2, ci_type = ?3, attributes_json = ?4, tags_json = ?5,
                 updated_at = ?6, updated_by = ?7
             WHERE id = ?1",
            params![
                ci.id.to_string(),
                ci.name,
                ci.ci_type,
                serde_json::to_string(&ci.attributes)?,
                serde_json::to_string(&ci.tags)?,
                ci.updated_at,
                ci.updated_by.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!(
                "configuration item {}",
                ci.id
            )));
        }

        let payload = serde_json::to_value(ci)?;
        Self::append_audit(
            &tx,
            EntityType::ConfigurationItem,
            ci.id,
            SyncAction::Update,
            ci.updated_by,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::ConfigurationItem,
            ci.id,
            SyncAction::Update,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    /// Delete a CI. Refuses while relationships reference it unless cascade
    /// is requested, in which case each removed relationship captures its
    /// own DELETE event first.
    pub fn delete_ci(&self, id: Uuid, actor_id: Uuid, cascade: bool) -> Result<Vec<SyncEvent>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let refs: i64 = tx.query_row(
            "SELECT COUNT(*) FROM relationships WHERE source_id = ?1 OR target_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if refs > 0 && !cascade {
            return Err(SyncError::InvalidRequest(format!(
                "configuration item {} is referenced by {} relationship(s)",
                id, refs
            )));
        }

        let mut events = Vec::new();
        if refs > 0 {
            let rel_ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM relationships WHERE source_id = ?1 OR target_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![id.to_string()], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            for rel_id in rel_ids {
                tx.execute(
                    "DELETE FROM relationships WHERE id = ?1",
                    params![rel_id],
                )?;
                let rel_uuid = Uuid::parse_str(&rel_id)
                    .map_err(|e| SyncError::PermanentIo(format!("bad relationship id: {}", e)))?;
                let payload = serde_json::json!({ "id": rel_id });
                Self::append_audit(
                    &tx,
                    EntityType::Relationship,
                    rel_uuid,
                    SyncAction::Delete,
                    actor_id,
                    payload.clone(),
                )?;
                events.push(Self::capture_event(
                    &tx,
                    EntityType::Relationship,
                    rel_uuid,
                    SyncAction::Delete,
                    payload,
                )?);
            }
        }

        let changed = tx.execute(
            "DELETE FROM configuration_items WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("configuration item {}", id)));
        }
        let payload = serde_json::json!({ "id": id });
        Self::append_audit(
            &tx,
            EntityType::ConfigurationItem,
            id,
            SyncAction::Delete,
            actor_id,
            payload.clone(),
        )?;
        events.push(Self::capture_event(
            &tx,
            EntityType::ConfigurationItem,
            id,
            SyncAction::Delete,
            payload,
        )?);
        tx.commit()?;
        Ok(events)
    }

    pub fn get_ci(&self, id: Uuid) -> Result<Option<ConfigurationItem>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, ci_type, attributes_json, tags_json,
                    created_at, updated_at, created_by, updated_by
             FROM configuration_items WHERE id = ?1",
            params![id.to_string()],
            row_to_ci,
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn list_cis(&self, filter: &CiFilter) -> Result<Page<ConfigurationItem>> {
        let conn = self.conn.lock().unwrap();
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(ci_type) = &filter.ci_type {
            clauses.push(format!("ci_type = ?{}", args.len() + 1));
            args.push(ci_type.clone());
        }
        if let Some(fragment) = &filter.name_contains {
            clauses.push(format!("name LIKE ?{}", args.len() + 1));
            args.push(format!("%{}%", fragment));
        }
        if let Some(tag) = &filter.tag {
            clauses.push(format!("tags_json LIKE ?{}", args.len() + 1));
            args.push(format!("%\"{}\"%", tag));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM configuration_items {}", where_sql),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get::<_, i64>(0),
        )? as u64;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, ci_type, attributes_json, tags_json,
                    created_at, updated_at, created_by, updated_by
             FROM configuration_items {} ORDER BY name LIMIT {} OFFSET {}",
            where_sql, limit, filter.offset
        ))?;
        let items = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_ci)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page { items, total })
    }

    /// CIs updated at or after the given timestamp (conflict sweep input).
    pub fn cis_updated_since(&self, since: i64) -> Result<Vec<ConfigurationItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, ci_type, attributes_json, tags_json,
                    created_at, updated_at, created_by, updated_by
             FROM configuration_items WHERE updated_at >= ?1",
        )?;
        let items = stmt
            .query_map(params![since], row_to_ci)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn ci_ids(&self) -> Result<Vec<Uuid>> {
        self.ids_of("configuration_items")
    }

    // ========== Relationships ==========

    /// Insert a relationship atomically with its audit entry and event.
    /// Endpoints must exist, self-references are rejected, and declared
    /// acyclic types must not close a cycle.
    pub fn create_relationship(&self, rel: &Relationship) -> Result<SyncEvent> {
        if rel.source_id == rel.target_id {
            return Err(SyncError::InvalidRequest(
                "relationship source and target must differ".to_string(),
            ));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for endpoint in [rel.source_id, rel.target_id] {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM configuration_items WHERE id = ?1",
                    params![endpoint.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(SyncError::InvalidRequest(format!(
                    "relationship endpoint {} does not exist",
                    endpoint
                )));
            }
        }

        if ACYCLIC_REL_TYPES.contains(&rel.rel_type.as_str())
            && Self::would_close_cycle(&tx, &rel.rel_type, rel.source_id, rel.target_id)?
        {
            return Err(SyncError::InvalidRequest(format!(
                "relationship would create a {} cycle",
                rel.rel_type
            )));
        }

        tx.execute(
            "INSERT INTO relationships
             (id, rel_type, source_id, target_id, attributes_json, created_at, updated_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rel.id.to_string(),
                rel.rel_type,
                rel.source_id.to_string(),
                rel.target_id.to_string(),
                serde_json::to_string(&rel.attributes)?,
                rel.created_at,
                rel.updated_at,
                rel.created_by.to_string(),
            ],
        )?;

        let payload = serde_json::to_value(rel)?;
        Self::append_audit(
            &tx,
            EntityType::Relationship,
            rel.id,
            SyncAction::Create,
            rel.created_by,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::Relationship,
            rel.id,
            SyncAction::Create,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    /// Depth-first walk over edges of one type: adding source -> target
    /// closes a cycle iff source is reachable from target.
    fn would_close_cycle(
        tx: &Transaction<'_>,
        rel_type: &str,
        source: Uuid,
        target: Uuid,
    ) -> Result<bool> {
        let mut stmt =
            tx.prepare("SELECT source_id, target_id FROM relationships WHERE rel_type = ?1")?;
        let edges: Vec<(String, String)> = stmt
            .query_map(params![rel_type], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let source = source.to_string();
        let mut frontier = vec![target.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = frontier.pop() {
            if current == source {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            for (s, t) in &edges {
                if *s == current {
                    frontier.push(t.clone());
                }
            }
        }
        Ok(false)
    }

    pub fn update_relationship(&self, rel: &Relationship) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE relationships
             SET rel_type = ?2, attributes_json = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                rel.id.to_string(),
                rel.rel_type,
                serde_json::to_string(&rel.attributes)?,
                rel.updated_at,
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("relationship {}", rel.id)));
        }

        let payload = serde_json::to_value(rel)?;
        Self::append_audit(
            &tx,
            EntityType::Relationship,
            rel.id,
            SyncAction::Update,
            rel.created_by,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::Relationship,
            rel.id,
            SyncAction::Update,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    pub fn delete_relationship(&self, id: Uuid, actor_id: Uuid) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "DELETE FROM relationships WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("relationship {}", id)));
        }
        let payload = serde_json::json!({ "id": id });
        Self::append_audit(
            &tx,
            EntityType::Relationship,
            id,
            SyncAction::Delete,
            actor_id,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::Relationship,
            id,
            SyncAction::Delete,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    pub fn get_relationship(&self, id: Uuid) -> Result<Option<Relationship>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, rel_type, source_id, target_id, attributes_json,
                    created_at, updated_at, created_by
             FROM relationships WHERE id = ?1",
            params![id.to_string()],
            row_to_relationship,
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn relationships_updated_since(&self, since: i64) -> Result<Vec<Relationship>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, rel_type, source_id, target_id, attributes_json,
                    created_at, updated_at, created_by
             FROM relationships WHERE updated_at >= ?1",
        )?;
        let items = stmt
            .query_map(params![since], row_to_relationship)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn relationship_ids(&self) -> Result<Vec<Uuid>> {
        self.ids_of("relationships")
    }

    // ========== Users and roles ==========

    pub fn create_user(&self, user: &User, actor_id: Uuid) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (id, username, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                user.created_at,
                user.updated_at,
            ],
        )?;
        let payload = serde_json::to_value(user)?;
        Self::append_audit(
            &tx,
            EntityType::User,
            user.id,
            SyncAction::Create,
            actor_id,
            payload.clone(),
        )?;
        let event =
            Self::capture_event(&tx, EntityType::User, user.id, SyncAction::Create, payload)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn create_role(&self, role: &Role, actor_id: Uuid) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO roles (id, name, description, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                role.id.to_string(),
                role.name,
                role.description,
                role.created_at,
            ],
        )?;
        let payload = serde_json::to_value(role)?;
        Self::append_audit(
            &tx,
            EntityType::Role,
            role.id,
            SyncAction::Create,
            actor_id,
            payload.clone(),
        )?;
        let event =
            Self::capture_event(&tx, EntityType::Role, role.id, SyncAction::Create, payload)?;
        tx.commit()?;
        Ok(event)
    }

    pub fn assign_role(&self, assignment: &UserRole) -> Result<SyncEvent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO user_roles (id, user_id, role_id, assigned_at, assigned_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                assignment.id.to_string(),
                assignment.user_id.to_string(),
                assignment.role_id.to_string(),
                assignment.assigned_at,
                assignment.assigned_by.to_string(),
            ],
        )?;
        let payload = serde_json::to_value(assignment)?;
        Self::append_audit(
            &tx,
            EntityType::UserRole,
            assignment.id,
            SyncAction::Create,
            assignment.assigned_by,
            payload.clone(),
        )?;
        let event = Self::capture_event(
            &tx,
            EntityType::UserRole,
            assignment.id,
            SyncAction::Create,
            payload,
        )?;
        tx.commit()?;
        Ok(event)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, created_at, updated_at FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(User {
                    id: parse_uuid(row, 0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn user_ids(&self) -> Result<Vec<Uuid>> {
        self.ids_of("users")
    }

    pub fn role_ids(&self) -> Result<Vec<Uuid>> {
        self.ids_of("roles")
    }

    fn ids_of(&self, table: &str) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY created_at", table))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }

    /// Current row of any captured entity as a JSON snapshot, for synthetic
    /// events and resyncs.
    pub fn entity_snapshot(&self, entity_type: EntityType, id: Uuid) -> Result<Option<Value>> {
        match entity_type {
            EntityType::ConfigurationItem => {
                Ok(self.get_ci(id)?.map(|ci| serde_json::to_value(ci).unwrap_or(Value::Null)))
            }
            EntityType::Relationship => Ok(self
                .get_relationship(id)?
                .map(|rel| serde_json::to_value(rel).unwrap_or(Value::Null))),
            EntityType::User => Ok(self
                .get_user(id)?
                .map(|u| serde_json::to_value(u).unwrap_or(Value::Null))),
            EntityType::Role => {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT id, name, description, created_at FROM roles WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "name": row.get::<_, String>(1)?,
                            "description": row.get::<_, Option<String>>(2)?,
                            "created_at": row.get::<_, i64>(3)?,
                        }))
                    },
                )
                .optional()
                .map_err(SyncError::from)
            }
            EntityType::UserRole => {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT id, user_id, role_id, assigned_at, assigned_by
                     FROM user_roles WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "user_id": row.get::<_, String>(1)?,
                            "role_id": row.get::<_, String>(2)?,
                            "assigned_at": row.get::<_, i64>(3)?,
                            "assigned_by": row.get::<_, String>(4)?,
                        }))
                    },
                )
                .optional()
                .map_err(SyncError::from)
            }
        }
    }

    /// Emit a synthetic event from the current relational snapshot
    /// (force-sync and resync paths).
    pub fn emit_synthetic_event(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        action: SyncAction,
    ) -> Result<SyncEvent> {
        let payload = match action {
            SyncAction::Delete => serde_json::json!({ "id": entity_id }),
            _ => self
                .entity_snapshot(entity_type, entity_id)?
                .ok_or_else(|| {
                    SyncError::NotFound(format!("{} {}", entity_type.as_str(), entity_id))
                })?,
        };
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let event = Self::capture_event(&tx, entity_type, entity_id, action, payload)?;
        tx.commit()?;
        Ok(event)
    }

    // ========== Attribute schemas ==========

    /// Register or replace the schema for a type; the version bumps on
    /// every replacement.
    pub fn upsert_schema(
        &self,
        entity_type: EntityType,
        target_type: &str,
        strict: bool,
        attributes: &BTreeMap<String, AttributeSchema>,
    ) -> Result<SchemaDefinition> {
        let table = schema_table(entity_type)?;
        let conn = self.conn.lock().unwrap();
        let now = now_ms();

        let existing: Option<(String, u32, i64)> = conn
            .query_row(
                &format!(
                    "SELECT id, version, created_at FROM {} WHERE target_type = ?1",
                    table
                ),
                params![target_type],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (id, version, created_at) = match existing {
            Some((id, version, created_at)) => (
                Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::new_v4()),
                version + 1,
                created_at,
            ),
            None => (Uuid::new_v4(), 1, now),
        };

        conn.execute(
            &format!(
                "INSERT INTO {} (target_type, id, version, strict, attributes_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(target_type) DO UPDATE SET
                     version = excluded.version,
                     strict = excluded.strict,
                     attributes_json = excluded.attributes_json,
                     updated_at = excluded.updated_at",
                table
            ),
            params![
                target_type,
                id.to_string(),
                version,
                strict as i64,
                serde_json::to_string(attributes)?,
                created_at,
                now,
            ],
        )?;

        Ok(SchemaDefinition {
            id,
            target_type: target_type.to_string(),
            version,
            strict,
            attributes: attributes.clone(),
            created_at,
            updated_at: now,
        })
    }

    /// Current schema for a type, if one is registered.
    pub fn get_schema(
        &self,
        entity_type: EntityType,
        target_type: &str,
    ) -> Result<Option<SchemaDefinition>> {
        let table = schema_table(entity_type)?;
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT id, target_type, version, strict, attributes_json, created_at, updated_at
                 FROM {} WHERE target_type = ?1",
                table
            ),
            params![target_type],
            |row| {
                let attributes_json: String = row.get(4)?;
                Ok(SchemaDefinition {
                    id: parse_uuid(row, 0)?,
                    target_type: row.get(1)?,
                    version: row.get(2)?,
                    strict: row.get::<_, i64>(3)? != 0,
                    attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(SyncError::from)
    }

    // ========== Event queue ==========

    /// Atomically claim a batch of dispatchable events for one worker:
    /// oldest PENDING rows plus PROCESSING rows whose lease expired. An
    /// event is withheld while an older event for the same entity is still
    /// unfinished, which keeps per-entity commit order.
    pub fn claim_events(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease_timeout_ms: i64,
    ) -> Result<Vec<SyncEvent>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_ms();
        let lease_cutoff = now - lease_timeout_ms;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM sync_events e
                 WHERE (e.status = 'PENDING'
                        OR (e.status = 'PROCESSING' AND e.claimed_at < ?1))
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_events older
                       WHERE older.entity_type = e.entity_type
                         AND older.entity_id = e.entity_id
                         AND older.status IN ('PENDING', 'PROCESSING')
                         AND (older.created_at < e.created_at
                              OR (older.created_at = e.created_at AND older.seq < e.seq))
                   )
                 ORDER BY e.created_at, e.seq
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![lease_cutoff, batch_size as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut events = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE sync_events
                 SET status = 'PROCESSING', claimed_by = ?2, claimed_at = ?3, updated_at = ?3
                 WHERE id = ?1",
                params![id, worker_id, now],
            )?;
            if let Some(event) = Self::event_by_id_tx(&tx, id)? {
                events.push(event);
            }
        }
        tx.commit()?;
        Ok(events)
    }

    fn event_by_id_tx(tx: &Transaction<'_>, id: &str) -> Result<Option<SyncEvent>> {
        tx.query_row(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events WHERE id = ?1",
            params![id],
            row_to_event,
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events WHERE id = ?1",
            params![id.to_string()],
            row_to_event,
        )
        .optional()
        .map_err(SyncError::from)
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete_event(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "UPDATE sync_events
             SET status = 'COMPLETED', processed_at = ?2, updated_at = ?2,
                 claimed_by = NULL, claimed_at = NULL, retry_at = NULL
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id.to_string(), now],
        )?;
        Ok(())
    }

    /// PROCESSING -> FAILED. `retry_at` schedules the requeue sweep; pass
    /// None for terminal failures.
    pub fn fail_event(&self, id: Uuid, error: &str, retry_at: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_events
             SET status = 'FAILED', retry_count = retry_count + 1,
                 last_error = ?2, retry_at = ?3, updated_at = ?4,
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            params![id.to_string(), error, retry_at, now_ms()],
        )?;
        Ok(())
    }

    /// FAILED -> PENDING for events whose backoff elapsed. Returns the
    /// number of requeued events.
    pub fn requeue_due_retries(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_events
             SET status = 'PENDING', retry_at = NULL, updated_at = ?1
             WHERE status = 'FAILED' AND retry_at IS NOT NULL AND retry_at <= ?1",
            params![now_ms()],
        )?;
        Ok(changed)
    }

    /// Explicit FAILED -> PENDING requeue (fallback replay path).
    /// `retry_count` stays monotonic; only the schedule and error reset.
    pub fn requeue_event(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_events
             SET status = 'PENDING', retry_at = NULL, last_error = NULL,
                 updated_at = ?2, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1 AND status = 'FAILED'",
            params![id.to_string(), now_ms()],
        )?;
        if changed == 0 {
            return Err(SyncError::InvalidRequest(format!(
                "event {} is not FAILED",
                id
            )));
        }
        Ok(())
    }

    pub fn queue_depths(&self) -> Result<QueueDepths> {
        let conn = self.conn.lock().unwrap();
        let mut depths = QueueDepths::default();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM sync_events GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "PENDING" => depths.pending = count as u64,
                "PROCESSING" => depths.processing = count as u64,
                "FAILED" => depths.failed = count as u64,
                _ => {}
            }
        }
        Ok(depths)
    }

    /// Average milliseconds PENDING events have been waiting.
    pub fn avg_pending_wait_ms(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(?1 - created_at) FROM sync_events WHERE status = 'PENDING'",
            params![now_ms()],
            |row| row.get(0),
        )?;
        Ok(avg.unwrap_or(0.0) as i64)
    }

    pub fn last_processed_at(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT MAX(processed_at) FROM sync_events WHERE processed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .map_err(SyncError::from)
    }

    /// Terminally failed events with no fallback operation yet. This is the
    /// polling path behind the in-memory error channel: anything the
    /// channel dropped is found here.
    pub fn unhandled_exhausted_events(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events e
             WHERE e.status = 'FAILED' AND e.retry_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM sync_fallback_operations f
                   WHERE f.original_event_id = e.id
               )
             ORDER BY e.updated_at LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Most recent FAILED events, newest first (selective resync input).
    pub fn recent_failed_events(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events WHERE status = 'FAILED'
             ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events ORDER BY created_at DESC, seq DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn events_for_entity(&self, entity_type: EntityType, id: Uuid) -> Result<Vec<SyncEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, action, payload, status, retry_count,
                    last_error, seq, claimed_by, claimed_at, retry_at,
                    created_at, updated_at, processed_at
             FROM sync_events WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at, seq",
        )?;
        let events = stmt
            .query_map(params![entity_type.as_str(), id.to_string()], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Delete COMPLETED events older than the horizon.
    pub fn cleanup_completed_events(&self, horizon_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = now_ms() - horizon_ms;
        let deleted = conn.execute(
            "DELETE FROM sync_events WHERE status = 'COMPLETED' AND processed_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ========== Sync log and stats ==========

    pub fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_log (id, event_id, worker, outcome, duration_ms, detail, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id.to_string(),
                entry.event_id.to_string(),
                entry.worker,
                entry.outcome,
                entry.duration_ms,
                entry.detail,
                entry.logged_at,
            ],
        )?;
        Ok(())
    }

    /// (total applies, failed applies, average duration) since a timestamp.
    pub fn sync_log_window(&self, since: i64) -> Result<(u64, u64, f64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(duration_ms), 0.0)
             FROM sync_log WHERE logged_at >= ?1",
            params![since],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, f64>(2)?,
                ))
            },
        )
        .map_err(SyncError::from)
    }

    pub fn bump_stats(
        &self,
        processed: u64,
        failed: u64,
        conflicts_detected: u64,
        conflicts_resolved: u64,
        full_resyncs: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_stats SET
                 events_processed = events_processed + ?1,
                 events_failed = events_failed + ?2,
                 conflicts_detected = conflicts_detected + ?3,
                 conflicts_resolved = conflicts_resolved + ?4,
                 full_resyncs = full_resyncs + ?5,
                 updated_at = ?6
             WHERE id = 1",
            params![
                processed as i64,
                failed as i64,
                conflicts_detected as i64,
                conflicts_resolved as i64,
                full_resyncs as i64,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<SyncStats> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT events_processed, events_failed, conflicts_detected,
                    conflicts_resolved, full_resyncs, updated_at
             FROM sync_stats WHERE id = 1",
            [],
            |row| {
                Ok(SyncStats {
                    events_processed: row.get::<_, i64>(0)? as u64,
                    events_failed: row.get::<_, i64>(1)? as u64,
                    conflicts_detected: row.get::<_, i64>(2)? as u64,
                    conflicts_resolved: row.get::<_, i64>(3)? as u64,
                    full_resyncs: row.get::<_, i64>(4)? as u64,
                    updated_at: row.get(5)?,
                })
            },
        )
        .map_err(SyncError::from)
    }

    // ========== Conflicts ==========

    /// Record a conflict. The partial unique index keeps one unresolved
    /// record per entity; re-detections of the same divergence are ignored.
    /// Returns whether a new record was inserted.
    pub fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sync_conflicts
             (id, entity_type, entity_id, conflict_type, relational_snapshot,
              graph_snapshot, strategy, resolved, resolved_by, resolved_at,
              detected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, NULL, ?8, ?8)",
            params![
                conflict.id.to_string(),
                conflict.entity_type.as_str(),
                conflict.entity_id.to_string(),
                conflict.conflict_type.as_str(),
                serde_json::to_string(&conflict.relational_snapshot)?,
                serde_json::to_string(&conflict.graph_snapshot)?,
                conflict.strategy.as_str(),
                conflict.detected_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, entity_type, entity_id, conflict_type, relational_snapshot,
                    graph_snapshot, strategy, resolved, resolved_by, resolved_at,
                    detected_at, updated_at
             FROM sync_conflicts WHERE id = ?1",
            params![id.to_string()],
            row_to_conflict,
        )
        .optional()
        .map_err(SyncError::from)
    }

    pub fn unresolved_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, conflict_type, relational_snapshot,
                    graph_snapshot, strategy, resolved, resolved_by, resolved_at,
                    detected_at, updated_at
             FROM sync_conflicts WHERE resolved = 0 ORDER BY detected_at",
        )?;
        let conflicts = stmt
            .query_map([], row_to_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    pub fn mark_conflict_resolved(&self, id: Uuid, resolved_by: Option<Uuid>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE sync_conflicts
             SET resolved = 1, resolved_by = ?2, resolved_at = ?3, updated_at = ?3
             WHERE id = ?1 AND resolved = 0",
            params![id.to_string(), resolved_by.map(|u| u.to_string()), now],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("unresolved conflict {}", id)));
        }
        Ok(())
    }

    /// (unresolved, total) conflict counts.
    pub fn conflict_counts(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END), 0), COUNT(*)
             FROM sync_conflicts",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )
        .map_err(SyncError::from)
    }

    // ========== Alerts ==========

    /// Insert an alert unless an active one with the same severity and type
    /// exists. Returns whether the alert was created.
    pub fn insert_alert(&self, alert: &Alert) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let duplicate: Option<String> = conn
            .query_row(
                "SELECT id FROM sync_alerts
                 WHERE severity = ?1 AND alert_type = ?2 AND resolved = 0 AND expires_at > ?3",
                params![alert.severity.as_str(), alert.alert_type, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO sync_alerts
             (id, severity, alert_type, message, data, resolved, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                alert.id.to_string(),
                alert.severity.as_str(),
                alert.alert_type,
                alert.message,
                serde_json::to_string(&alert.data)?,
                alert.created_at,
                alert.expires_at,
            ],
        )?;
        Ok(true)
    }

    pub fn clear_alert(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_alerts SET resolved = 1, resolved_at = ?2 WHERE id = ?1 AND resolved = 0",
            params![id.to_string(), now_ms()],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("active alert {}", id)));
        }
        Ok(())
    }

    /// Resolve alerts past their TTL. Returns how many expired.
    pub fn expire_alerts(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE sync_alerts SET resolved = 1, resolved_at = ?1
             WHERE resolved = 0 AND expires_at <= ?1",
            params![now],
        )?;
        Ok(changed)
    }

    pub fn active_alerts(&self) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, severity, alert_type, message, data, resolved, resolved_at,
                    created_at, expires_at
             FROM sync_alerts WHERE resolved = 0 ORDER BY created_at DESC",
        )?;
        let alerts = stmt
            .query_map([], row_to_alert)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    // ========== Fallback operations ==========

    pub fn insert_fallback_operation(&self, op: &FallbackOperation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_fallback_operations
             (id, original_event_id, strategy, entity_type, entity_id, action,
              payload, retry_count, status, created_at, started_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                op.id.to_string(),
                op.original_event_id.to_string(),
                op.strategy.as_str(),
                op.entity_type.as_str(),
                op.entity_id.to_string(),
                op.action.as_str(),
                serde_json::to_string(&op.payload)?,
                op.retry_count,
                op.status.as_str(),
                op.created_at,
                op.started_at,
                op.completed_at,
                op.error,
            ],
        )?;
        Ok(())
    }

    /// Oldest pending fallback operations, flipped to processing.
    pub fn claim_fallback_operations(&self, batch: usize) -> Result<Vec<FallbackOperation>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = now_ms();

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM sync_fallback_operations
                 WHERE status = 'pending' ORDER BY created_at LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![batch as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut ops = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE sync_fallback_operations
                 SET status = 'processing', started_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            let op = tx
                .query_row(
                    "SELECT id, original_event_id, strategy, entity_type, entity_id, action,
                            payload, retry_count, status, created_at, started_at, completed_at, error
                     FROM sync_fallback_operations WHERE id = ?1",
                    params![id],
                    row_to_fallback,
                )
                .optional()?;
            if let Some(op) = op {
                ops.push(op);
            }
        }
        tx.commit()?;
        Ok(ops)
    }

    pub fn finish_fallback_operation(
        &self,
        id: Uuid,
        status: FallbackStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_fallback_operations
             SET status = ?2, completed_at = ?3, error = ?4,
                 retry_count = retry_count + CASE WHEN ?2 = 'failed' THEN 1 ELSE 0 END
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), now_ms(), error],
        )?;
        Ok(())
    }

    /// Requeue a failed fallback operation for another drain pass.
    pub fn requeue_fallback_operation(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_fallback_operations
             SET status = 'pending', started_at = NULL, completed_at = NULL
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn pending_fallback_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sync_fallback_operations WHERE status = 'pending'",
            [],
            |row| Ok(row.get::<_, i64>(0)? as u64),
        )
        .map_err(SyncError::from)
    }

    /// Terminal fallback failures already recorded for an event, used to
    /// promote the strategy on repeated failure.
    pub fn fallback_failures_for_event(&self, event_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sync_fallback_operations
             WHERE original_event_id = ?1 AND status = 'failed'",
            params![event_id.to_string()],
            |row| Ok(row.get::<_, i64>(0)? as u64),
        )
        .map_err(SyncError::from)
    }

    pub fn append_fallback_log(&self, operation_id: Uuid, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_fallback_log (id, operation_id, message, logged_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                operation_id.to_string(),
                message,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_fallback_operation(&self, id: Uuid) -> Result<Option<FallbackOperation>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, original_event_id, strategy, entity_type, entity_id, action,
                    payload, retry_count, status, created_at, started_at, completed_at, error
             FROM sync_fallback_operations WHERE id = ?1",
            params![id.to_string()],
            row_to_fallback,
        )
        .optional()
        .map_err(SyncError::from)
    }

    // ========== Full resync flag ==========

    /// Take the full-resync mutex. The flag is a singleton row so the lock
    /// survives restarts; returns false when a resync is already running.
    pub fn try_begin_full_resync(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO sync_full_resync_status (id, in_progress, started_at, completed_at)
             VALUES (1, 1, ?1, NULL)
             ON CONFLICT(id) DO UPDATE SET
                 in_progress = 1, started_at = excluded.started_at, completed_at = NULL
             WHERE sync_full_resync_status.in_progress = 0",
            params![now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn finish_full_resync(&self, report: &ResyncReport) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_full_resync_status
             SET in_progress = 0, completed_at = ?1, report_json = ?2 WHERE id = 1",
            params![now_ms(), serde_json::to_string(report)?],
        )?;
        Ok(())
    }

    pub fn full_resync_status(&self) -> Result<FullResyncStatus> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row(
                "SELECT in_progress, started_at, completed_at, report_json
                 FROM sync_full_resync_status WHERE id = 1",
                [],
                |row| {
                    let report_json: Option<String> = row.get(3)?;
                    Ok(FullResyncStatus {
                        in_progress: row.get::<_, i64>(0)? != 0,
                        started_at: row.get(1)?,
                        completed_at: row.get(2)?,
                        last_report: report_json
                            .and_then(|j| serde_json::from_str(&j).ok()),
                    })
                },
            )
            .optional()?;
        Ok(status.unwrap_or_default())
    }

    // ========== Audit ==========

    pub fn audit_for_entity(&self, entity_type: EntityType, id: Uuid) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, action, changed_by, changed_at, details
             FROM audit_logs WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY changed_at",
        )?;
        let entries = stmt
            .query_map(params![entity_type.as_str(), id.to_string()], |row| {
                let details: String = row.get(6)?;
                Ok(AuditEntry {
                    id: parse_uuid(row, 0)?,
                    entity_type: row.get(1)?,
                    entity_id: parse_uuid(row, 2)?,
                    action: row.get(3)?,
                    changed_by: parse_uuid(row, 4)?,
                    changed_at: row.get(5)?,
                    details: serde_json::from_str(&details).unwrap_or(Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Connectivity probe for the monitor.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Overwrite a CI row from a graph snapshot (graph-wins resolution).
    /// The change is captured like any other write so the projection
    /// re-converges through the normal pipeline.
    pub fn overwrite_ci_from_snapshot(
        &self,
        snapshot: &Value,
        actor_id: Uuid,
    ) -> Result<SyncEvent> {
        let mut ci: ConfigurationItem = serde_json::from_value(snapshot.clone())?;
        ci.updated_by = actor_id;
        self.update_ci(&ci)
    }
}

fn schema_table(entity_type: EntityType) -> Result<&'static str> {
    match entity_type {
        EntityType::ConfigurationItem => Ok("ci_type_schemas"),
        EntityType::Relationship => Ok("relationship_type_schemas"),
        other => Err(SyncError::InvalidRequest(format!(
            "no schema table for {}",
            other.as_str()
        ))),
    }
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> std::result::Result<Uuid, rusqlite::Error> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn row_to_ci(row: &Row<'_>) -> std::result::Result<ConfigurationItem, rusqlite::Error> {
    let attributes_json: String = row.get(3)?;
    let tags_json: String = row.get(4)?;
    Ok(ConfigurationItem {
        id: parse_uuid(row, 0)?,
        name: row.get(1)?,
        ci_type: row.get(2)?,
        attributes: serde_json::from_str::<Map<String, Value>>(&attributes_json)
            .unwrap_or_default(),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        created_by: parse_uuid(row, 7)?,
        updated_by: parse_uuid(row, 8)?,
    })
}

fn row_to_relationship(row: &Row<'_>) -> std::result::Result<Relationship, rusqlite::Error> {
    let attributes_json: String = row.get(4)?;
    Ok(Relationship {
        id: parse_uuid(row, 0)?,
        rel_type: row.get(1)?,
        source_id: parse_uuid(row, 2)?,
        target_id: parse_uuid(row, 3)?,
        attributes: serde_json::from_str::<Map<String, Value>>(&attributes_json)
            .unwrap_or_default(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        created_by: parse_uuid(row, 7)?,
    })
}

fn row_to_event(row: &Row<'_>) -> std::result::Result<SyncEvent, rusqlite::Error> {
    let entity_type: String = row.get(1)?;
    let action: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(SyncEvent {
        id: parse_uuid(row, 0)?,
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::ConfigurationItem),
        entity_id: parse_uuid(row, 2)?,
        action: SyncAction::parse(&action).unwrap_or(SyncAction::Update),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        status: EventStatus::parse(&status).unwrap_or(EventStatus::Pending),
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        seq: row.get(8)?,
        claimed_by: row.get(9)?,
        claimed_at: row.get(10)?,
        retry_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        processed_at: row.get(14)?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> std::result::Result<ConflictRecord, rusqlite::Error> {
    let entity_type: String = row.get(1)?;
    let conflict_type: String = row.get(3)?;
    let relational: String = row.get(4)?;
    let graph: String = row.get(5)?;
    let strategy: String = row.get(6)?;
    let resolved_by: Option<String> = row.get(8)?;
    Ok(ConflictRecord {
        id: parse_uuid(row, 0)?,
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::ConfigurationItem),
        entity_id: parse_uuid(row, 2)?,
        conflict_type: ConflictType::parse(&conflict_type).unwrap_or(ConflictType::DataMismatch),
        relational_snapshot: serde_json::from_str(&relational).unwrap_or(Value::Null),
        graph_snapshot: serde_json::from_str(&graph).unwrap_or(Value::Null),
        strategy: strategy.parse().unwrap_or(ConflictStrategy::Manual),
        resolved: row.get::<_, i64>(7)? != 0,
        resolved_by: resolved_by.and_then(|s| Uuid::parse_str(&s).ok()),
        resolved_at: row.get(9)?,
        detected_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> std::result::Result<Alert, rusqlite::Error> {
    let severity: String = row.get(1)?;
    let data: String = row.get(4)?;
    Ok(Alert {
        id: parse_uuid(row, 0)?,
        severity: AlertSeverity::parse(&severity).unwrap_or(AlertSeverity::Info),
        alert_type: row.get(2)?,
        message: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        resolved: row.get::<_, i64>(5)? != 0,
        resolved_at: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
    })
}

fn row_to_fallback(row: &Row<'_>) -> std::result::Result<FallbackOperation, rusqlite::Error> {
    let strategy: String = row.get(2)?;
    let entity_type: String = row.get(3)?;
    let action: String = row.get(5)?;
    let payload: String = row.get(6)?;
    let status: String = row.get(8)?;
    Ok(FallbackOperation {
        id: parse_uuid(row, 0)?,
        original_event_id: parse_uuid(row, 1)?,
        strategy: strategy.parse().unwrap_or(FallbackStrategy::Manual),
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::ConfigurationItem),
        entity_id: parse_uuid(row, 4)?,
        action: SyncAction::parse(&action).unwrap_or(SyncAction::Update),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        retry_count: row.get(7)?,
        status: FallbackStatus::parse(&status).unwrap_or(FallbackStatus::Pending),
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        error: row.get(12)?,
    })
}
