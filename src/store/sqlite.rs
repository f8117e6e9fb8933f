// SQLite persistence. Protocol rows keep the indexed columns next to the
// full JSON document; the unique index on `(org_unit, number)` serializes
// allocation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row};
use tracing::info;

use crate::audit::AuditEntry;
use crate::error::StoreError;
use crate::protocol::effects::MemberDirectory;
use crate::protocol::numbering::ProtocolNumber;
use crate::protocol::types::{
    normalize_national_id, Member, MemberId, NewMember, OrgUnitId, Protocol, ProtocolId,
    ProtocolType,
};
use crate::store::{ProtocolFilter, ProtocolStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> Result<T, StoreError> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

impl SqliteStore {
    /// Connect, creating the database file if needed
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> Result<Self, StoreError> {
        if !database_url.contains(":memory:") && !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        let store = Self { pool };
        if auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1, true).await
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_audit_rows(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entries: &[AuditEntry],
    ) -> Result<(), StoreError> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO audit_entries (id, protocol_id, action, created_at, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(entry.id.to_string())
            .bind(entry.protocol_id.to_string())
            .bind(entry.action.as_str())
            .bind(timestamp(entry.created_at))
            .bind(serde_json::to_string(entry)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn update_member<F>(&self, id: MemberId, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Member) -> bool + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data FROM members WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id.0))?;
        let mut member: Member = decode(&row)?;
        if !change(&mut member) {
            return Ok(false);
        }
        sqlx::query("UPDATE members SET data = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(&member)?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl ProtocolStore for SqliteStore {
    async fn insert_protocol(&self, protocol: &Protocol, entries: &[AuditEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO protocols
                (id, number, org_unit, protocol_type, year, stage, status, version, created_at, deleted_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(protocol.id.to_string())
        .bind(protocol.number.to_string())
        .bind(protocol.org_unit.to_string())
        .bind(protocol.protocol_type.as_str())
        .bind(protocol.number.year())
        .bind(protocol.stage.as_str())
        .bind(protocol.status.as_str())
        .bind(protocol.version)
        .bind(timestamp(protocol.created_at))
        .bind(protocol.deleted_at.map(timestamp))
        .bind(serde_json::to_string(protocol)?)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::DuplicateNumber(protocol.number.to_string()));
            }
            return Err(err.into());
        }

        Self::insert_audit_rows(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_protocol(&self, id: ProtocolId) -> Result<Option<Protocol>, StoreError> {
        let row = sqlx::query("SELECT data FROM protocols WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode::<Protocol>).transpose()
    }

    async fn find_by_number(
        &self,
        org_unit: OrgUnitId,
        number: &ProtocolNumber,
    ) -> Result<Option<Protocol>, StoreError> {
        let row = sqlx::query("SELECT data FROM protocols WHERE org_unit = ?1 AND number = ?2")
            .bind(org_unit.to_string())
            .bind(number.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode::<Protocol>).transpose()
    }

    async fn count_protocols(
        &self,
        org_unit: OrgUnitId,
        protocol_type: ProtocolType,
        year: i32,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM protocols
            WHERE org_unit = ?1 AND protocol_type = ?2 AND year = ?3
            "#,
        )
        .bind(org_unit.to_string())
        .bind(protocol_type.as_str())
        .bind(year)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as u32)
    }

    async fn commit_update(
        &self,
        protocol: &Protocol,
        expected_version: i64,
        entries: &[AuditEntry],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE protocols
            SET stage = ?1, status = ?2, version = ?3, deleted_at = ?4, data = ?5
            WHERE id = ?6 AND version = ?7
            "#,
        )
        .bind(protocol.stage.as_str())
        .bind(protocol.status.as_str())
        .bind(protocol.version)
        .bind(protocol.deleted_at.map(timestamp))
        .bind(serde_json::to_string(protocol)?)
        .bind(protocol.id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current = sqlx::query("SELECT version FROM protocols WHERE id = ?1")
                .bind(protocol.id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            return match current {
                Some(row) => Err(StoreError::VersionConflict {
                    id: protocol.id.0,
                    expected: expected_version,
                    found: row.try_get("version")?,
                }),
                None => Err(StoreError::NotFound(protocol.id.0)),
            };
        }

        Self::insert_audit_rows(&mut tx, entries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM protocols WHERE id = ?1")
            .bind(entry.protocol_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(entry.protocol_id.0));
        }
        Self::insert_audit_rows(&mut tx, std::slice::from_ref(entry)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit_entries(&self, protocol_id: ProtocolId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query("SELECT data FROM audit_entries WHERE protocol_id = ?1 ORDER BY seq ASC")
            .bind(protocol_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode::<AuditEntry>).collect()
    }

    async fn list_protocols(&self, filter: &ProtocolFilter) -> Result<Vec<Protocol>, StoreError> {
        let rows = sqlx::query("SELECT data FROM protocols ORDER BY created_at ASC, number ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut protocols = Vec::with_capacity(rows.len());
        for row in &rows {
            let protocol: Protocol = decode(row)?;
            if filter.matches(&protocol) {
                protocols.push(protocol);
            }
        }
        Ok(protocols)
    }
}

#[async_trait]
impl MemberDirectory for SqliteStore {
    async fn get_member(&self, id: MemberId) -> Result<Option<Member>, StoreError> {
        let row = sqlx::query("SELECT data FROM members WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode::<Member>).transpose()
    }

    async fn set_member_active(&self, id: MemberId, active: bool) -> Result<bool, StoreError> {
        self.update_member(id, |member| {
            if member.active == active {
                return false;
            }
            member.active = active;
            true
        })
        .await
    }

    async fn mark_maturity(&self, id: MemberId, date: NaiveDate) -> Result<bool, StoreError> {
        self.update_member(id, |member| {
            if member.maturity_reached {
                return false;
            }
            member.maturity_reached = true;
            member.maturity_date = Some(date);
            true
        })
        .await
    }

    async fn find_by_national_ids(&self, national_ids: &[String]) -> Result<Vec<Member>, StoreError> {
        let mut found = Vec::new();
        for national_id in national_ids {
            let row = sqlx::query("SELECT data FROM members WHERE national_id = ?1")
                .bind(normalize_national_id(national_id))
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                found.push(decode(&row)?);
            }
        }
        Ok(found)
    }

    async fn create_members(&self, members: &[NewMember]) -> Result<Vec<Member>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut created = Vec::with_capacity(members.len());
        for candidate in members {
            let member = Member {
                id: MemberId::new(),
                org_unit: candidate.org_unit,
                name: candidate.name.clone(),
                national_id: normalize_national_id(&candidate.national_id),
                active: true,
                maturity_reached: false,
                maturity_date: None,
                birth_date: candidate.birth_date,
                email: candidate.email.clone(),
                created_at: now,
            };
            let inserted = sqlx::query(
                "INSERT INTO members (id, org_unit, national_id, name, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(member.id.to_string())
            .bind(member.org_unit.to_string())
            .bind(&member.national_id)
            .bind(&member.name)
            .bind(serde_json::to_string(&member)?)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => created.push(member),
                // dropping `tx` rolls back the members inserted so far
                Err(err) if is_unique_violation(&err) => {
                    return Err(StoreError::DuplicateMember(candidate.national_id.clone()))
                }
                Err(err) => return Err(err.into()),
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn list_members(&self, org_unit: Option<OrgUnitId>) -> Result<Vec<Member>, StoreError> {
        let rows = match org_unit {
            Some(org) => {
                sqlx::query("SELECT data FROM members WHERE org_unit = ?1 ORDER BY name ASC")
                    .bind(org.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT data FROM members ORDER BY name ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(decode::<Member>).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mocks::sample_protocol;

    #[tokio::test]
    async fn test_unique_number_index() {
        let store = SqliteStore::in_memory().await.unwrap();
        let protocol = sample_protocol(ProtocolType::Transfer);
        store.insert_protocol(&protocol, &[]).await.unwrap();

        let mut twin = sample_protocol(ProtocolType::Transfer);
        twin.number = protocol.number.clone();
        store.insert_protocol(&twin, &[]).await.unwrap();

        twin.id = ProtocolId::new();
        twin.org_unit = protocol.org_unit;
        let result = store.insert_protocol(&twin, &[]).await;
        assert!(matches!(result, Err(StoreError::DuplicateNumber(_))));
        let found = store.find_by_number(protocol.org_unit, &protocol.number).await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(protocol.id));
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut protocol = sample_protocol(ProtocolType::Honors);
        store.insert_protocol(&protocol, &[]).await.unwrap();

        protocol.version = 2;
        store.commit_update(&protocol, 1, &[]).await.unwrap();
        let result = store.commit_update(&protocol, 1, &[]).await;
        assert!(matches!(
            result,
            Err(StoreError::VersionConflict { expected: 1, found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_audit_rows_cannot_be_changed() {
        let store = SqliteStore::in_memory().await.unwrap();
        let protocol = sample_protocol(ProtocolType::Honors);
        let entry = crate::audit::AuditRecord::new(crate::audit::AuditAction::Creation, "created")
            .into_entry(&protocol, None);
        store.insert_protocol(&protocol, &[entry]).await.unwrap();

        let update = sqlx::query("UPDATE audit_entries SET action = 'edit'")
            .execute(store.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM audit_entries").execute(store.pool()).await;
        assert!(delete.is_err());
        assert_eq!(store.audit_entries(protocol.id).await.unwrap().len(), 1);
    }
}
