//! Postgres storage backend built on sqlx.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::domain::{
    Applicant, Application, ApplicationId, ConfirmationCode, FlaggedSetId, HouseholdMember,
    ListingId, ListingSnapshot, UserId,
};
use super::flagging::{ApplicationFlaggedSet, FlaggedSetStatus, FlaggingRule};
use super::repository::{
    ApplicationFilter, FlaggingDatabase, FlaggingTransaction, ListingDirectory, RepositoryError,
};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

const APPLICATION_COLUMNS: &str = "id, listing_id, user_id, applicant, household_members, \
     submission_date, confirmation_code, marked_as_duplicate, created_at, updated_at, deleted_at";

const SET_COLUMNS: &str =
    "id, listing_id, rule, status, resolving_user_id, resolved_time, created_at, updated_at";

/// Classifies driver errors into the retry taxonomy.
pub fn map_sqlx_error(error: sqlx::Error) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                RepositoryError::SerializationFailure
            }
            Some(UNIQUE_VIOLATION) => RepositoryError::UniqueViolation {
                constraint: db.constraint().unwrap_or_default().to_string(),
            },
            _ => RepositoryError::Unavailable(error.to_string()),
        },
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        _ => RepositoryError::Unavailable(error.to_string()),
    }
}

/// Connection pool handing out SERIALIZABLE transactions.
#[derive(Debug, Clone)]
pub struct PgFlaggingDatabase {
    pool: PgPool,
}

impl PgFlaggingDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl FlaggingDatabase for PgFlaggingDatabase {
    type Transaction = PgTransaction;

    async fn begin_serializable(&self) -> Result<PgTransaction, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(PgTransaction { tx })
    }
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    id: Uuid,
    listing_id: Uuid,
    user_id: Option<Uuid>,
    applicant: Json<Applicant>,
    household_members: Json<Vec<HouseholdMember>>,
    submission_date: DateTime<Utc>,
    confirmation_code: String,
    marked_as_duplicate: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Application {
            id: ApplicationId(row.id),
            listing_id: ListingId(row.listing_id),
            user_id: row.user_id.map(UserId),
            applicant: row.applicant.0,
            household_members: row.household_members.0,
            submission_date: row.submission_date,
            confirmation_code: ConfirmationCode(row.confirmation_code),
            marked_as_duplicate: row.marked_as_duplicate,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SetRow {
    id: Uuid,
    listing_id: Uuid,
    rule: String,
    status: String,
    resolving_user_id: Option<Uuid>,
    resolved_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PgTransaction {
    async fn applications_where(
        &mut self,
        clause: &str,
        id: Uuid,
    ) -> Result<Vec<Application>, RepositoryError> {
        let sql = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE {clause}");
        let rows: Vec<ApplicationRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Application::from).collect())
    }

    /// Loads set rows and attaches both membership lists in stored order.
    async fn hydrate_sets(
        &mut self,
        rows: Vec<SetRow>,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let members = self
            .memberships("application_flagged_set_applications", &ids)
            .await?;
        let resolved = self
            .memberships("application_flagged_set_resolved_applications", &ids)
            .await?;

        rows.into_iter()
            .map(|row| {
                let rule = FlaggingRule::from_key(&row.rule).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown flagging rule '{}'", row.rule))
                })?;
                let status = FlaggedSetStatus::from_label(&row.status).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown set status '{}'", row.status))
                })?;
                Ok(ApplicationFlaggedSet {
                    id: FlaggedSetId(row.id),
                    listing_id: ListingId(row.listing_id),
                    rule,
                    status,
                    applications: members.get(&row.id).cloned().unwrap_or_default(),
                    resolved_applications: resolved.get(&row.id).cloned().unwrap_or_default(),
                    resolving_user_id: row.resolving_user_id.map(UserId),
                    resolved_time: row.resolved_time,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn memberships(
        &mut self,
        table: &str,
        set_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<ApplicationId>>, RepositoryError> {
        let sql = format!(
            "SELECT set_id, application_id FROM {table} WHERE set_id = ANY($1) ORDER BY set_id, position"
        );
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(&sql)
            .bind(set_ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        let mut grouped: HashMap<Uuid, Vec<ApplicationId>> = HashMap::new();
        for (set_id, application_id) in rows {
            grouped
                .entry(set_id)
                .or_default()
                .push(ApplicationId(application_id));
        }
        Ok(grouped)
    }

    async fn sets_where(
        &mut self,
        clause: &str,
        bind_uuid: Uuid,
        bind_text: Option<&str>,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        let sql = format!(
            "SELECT {SET_COLUMNS} FROM application_flagged_sets WHERE {clause} ORDER BY created_at, id"
        );
        let mut query = sqlx::query_as::<_, SetRow>(&sql).bind(bind_uuid);
        if let Some(text) = bind_text {
            query = query.bind(text);
        }
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        self.hydrate_sets(rows).await
    }

    async fn write_memberships(
        &mut self,
        table: &str,
        set_id: FlaggedSetId,
        members: &[ApplicationId],
    ) -> Result<(), RepositoryError> {
        sqlx::query(&format!("DELETE FROM {table} WHERE set_id = $1"))
            .bind(set_id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        if members.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = members.iter().map(|member| member.0).collect();
        sqlx::query(&format!(
            "INSERT INTO {table} (set_id, application_id, position) \
             SELECT $1, member.id, member.ord FROM UNNEST($2::uuid[]) WITH ORDINALITY AS member(id, ord)"
        ))
        .bind(set_id.0)
        .bind(&ids)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn write_set_members(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError> {
        self.write_memberships("application_flagged_set_applications", set.id, &set.applications)
            .await?;
        self.write_memberships(
            "application_flagged_set_resolved_applications",
            set.id,
            &set.resolved_applications,
        )
        .await
    }
}

#[async_trait]
impl FlaggingTransaction for PgTransaction {
    async fn fetch_application(
        &mut self,
        id: ApplicationId,
    ) -> Result<Option<Application>, RepositoryError> {
        Ok(self.applications_where("id = $1", id.0).await?.into_iter().next())
    }

    async fn listing_applications(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<Application>, RepositoryError> {
        self.applications_where(
            "listing_id = $1 AND deleted_at IS NULL ORDER BY submission_date, id",
            listing_id.0,
        )
        .await
    }

    async fn search_applications(
        &mut self,
        filter: &ApplicationFilter,
    ) -> Result<Vec<Application>, RepositoryError> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications \
             WHERE deleted_at IS NULL \
               AND ($1::uuid IS NULL OR listing_id = $1) \
               AND ($2::uuid IS NULL OR user_id = $2) \
               AND ($3::boolean IS NULL OR marked_as_duplicate = $3)"
        );
        let rows: Vec<ApplicationRow> = sqlx::query_as(&sql)
            .bind(filter.listing_id.map(|id| id.0))
            .bind(filter.user_id.map(|id| id.0))
            .bind(filter.marked_as_duplicate)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows
            .into_iter()
            .map(Application::from)
            .filter(|application| filter.admits(application))
            .collect())
    }

    async fn confirmation_code_exists(
        &mut self,
        listing_id: ListingId,
        code: &ConfirmationCode,
    ) -> Result<bool, RepositoryError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM applications WHERE listing_id = $1 AND confirmation_code = $2)",
        )
        .bind(listing_id.0)
        .bind(code.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn insert_application(
        &mut self,
        application: &Application,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO applications (id, listing_id, user_id, applicant, household_members, \
             submission_date, confirmation_code, marked_as_duplicate, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(application.id.0)
        .bind(application.listing_id.0)
        .bind(application.user_id.map(|id| id.0))
        .bind(Json(&application.applicant))
        .bind(Json(&application.household_members))
        .bind(application.submission_date)
        .bind(application.confirmation_code.as_str())
        .bind(application.marked_as_duplicate)
        .bind(application.created_at)
        .bind(application.updated_at)
        .bind(application.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_application(
        &mut self,
        application: &Application,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE applications SET user_id = $2, applicant = $3, household_members = $4, \
             marked_as_duplicate = $5, updated_at = $6, deleted_at = $7 WHERE id = $1",
        )
        .bind(application.id.0)
        .bind(application.user_id.map(|id| id.0))
        .bind(Json(&application.applicant))
        .bind(Json(&application.household_members))
        .bind(application.marked_as_duplicate)
        .bind(application.updated_at)
        .bind(application.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_duplicate_flag(
        &mut self,
        id: ApplicationId,
        marked_as_duplicate: bool,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE applications SET marked_as_duplicate = $2 \
             WHERE id = $1 AND marked_as_duplicate IS DISTINCT FROM $2",
        )
        .bind(id.0)
        .bind(marked_as_duplicate)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 && self.fetch_application(id).await?.is_none() {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn fetch_set(
        &mut self,
        id: FlaggedSetId,
    ) -> Result<Option<ApplicationFlaggedSet>, RepositoryError> {
        Ok(self.sets_where("id = $1", id.0, None).await?.into_iter().next())
    }

    async fn listing_sets(
        &mut self,
        listing_id: ListingId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        self.sets_where("listing_id = $1", listing_id.0, None).await
    }

    async fn open_sets(
        &mut self,
        listing_id: ListingId,
        rule: FlaggingRule,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        self.sets_where(
            "listing_id = $1 AND rule = $2 AND status = 'open'",
            listing_id.0,
            Some(rule.key()),
        )
        .await
    }

    async fn sets_containing(
        &mut self,
        application_id: ApplicationId,
    ) -> Result<Vec<ApplicationFlaggedSet>, RepositoryError> {
        self.sets_where(
            "id IN (SELECT set_id FROM application_flagged_set_applications WHERE application_id = $1)",
            application_id.0,
            None,
        )
        .await
    }

    async fn insert_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO application_flagged_sets \
             (id, listing_id, rule, status, resolving_user_id, resolved_time, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(set.id.0)
        .bind(set.listing_id.0)
        .bind(set.rule.key())
        .bind(set.status.label())
        .bind(set.resolving_user_id.map(|id| id.0))
        .bind(set.resolved_time)
        .bind(set.created_at)
        .bind(set.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        self.write_set_members(set).await
    }

    async fn update_set(&mut self, set: &ApplicationFlaggedSet) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE application_flagged_sets SET status = $2, resolving_user_id = $3, \
             resolved_time = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(set.id.0)
        .bind(set.status.label())
        .bind(set.resolving_user_id.map(|id| id.0))
        .bind(set.resolved_time)
        .bind(set.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        self.write_set_members(set).await
    }

    async fn delete_set(&mut self, id: FlaggedSetId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM application_flagged_sets WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

/// Listing lookup over the `listings` table.
#[derive(Debug, Clone)]
pub struct PgListingDirectory {
    pool: PgPool,
}

impl PgListingDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, listing: &ListingSnapshot) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO listings (id, name, application_due_date) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
             application_due_date = EXCLUDED.application_due_date",
        )
        .bind(listing.id.0)
        .bind(&listing.name)
        .bind(listing.application_due_date)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl ListingDirectory for PgListingDirectory {
    async fn find_listing(
        &self,
        id: ListingId,
    ) -> Result<Option<ListingSnapshot>, RepositoryError> {
        let row: Option<(Uuid, String, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, name, application_due_date FROM listings WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(|(id, name, application_due_date)| ListingSnapshot {
            id: ListingId(id),
            name,
            application_due_date,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert_eq!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepositoryError::NotFound
        );
    }

    #[test]
    fn pool_errors_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            RepositoryError::Unavailable(_)
        ));
    }
}
