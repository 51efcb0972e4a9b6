use anyhow::Context;
use berth_db::entities::bots;
use berth_lifecycle::{BotId, BotStatus, HealthStatus, IsolationKey, derive_isolation_key};
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, sea_query::Expr,
};
use uuid::Uuid;

/// The persisted view of a bot that the control plane reads and corrects.
#[derive(Debug, Clone, PartialEq)]
pub struct BotRecord {
    pub id: BotId,
    pub tenant_id: Uuid,
    pub hostname: String,
    pub container_ref: Option<String>,
    pub status: BotStatus,
    pub health_status: HealthStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub gateway_port: Option<u16>,
    pub image: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    pub fn isolation_key(&self) -> IsolationKey {
        derive_isolation_key(&self.tenant_id.to_string(), &self.hostname)
    }
}

/// A partial write. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotPatch {
    pub status: Option<BotStatus>,
    pub container_ref: Option<Option<String>>,
    pub health_status: Option<HealthStatus>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Only apply the write while the stored status still equals this.
    pub expected_status: Option<BotStatus>,
}

impl BotPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: BotStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn container_ref(mut self, container_ref: Option<String>) -> Self {
        self.container_ref = Some(container_ref);
        self
    }

    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health_status = Some(health);
        self
    }

    pub fn checked_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_health_check_at = Some(at);
        self
    }

    pub fn when_status(mut self, expected: BotStatus) -> Self {
        self.expected_status = Some(expected);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.container_ref.is_none()
            && self.health_status.is_none()
            && self.last_health_check_at.is_none()
    }
}

/// Bot persistence as seen by the control plane. Soft-deleted bots are
/// invisible to every query.
#[async_trait::async_trait]
pub trait BotStore: Send + Sync {
    async fn get(&self, id: BotId) -> anyhow::Result<Option<BotRecord>>;
    async fn find_by_container_ref(&self, container_ref: &str) -> anyhow::Result<Option<BotRecord>>;
    async fn list_active(&self) -> anyhow::Result<Vec<BotRecord>>;
    async fn list_by_status(&self, status: BotStatus) -> anyhow::Result<Vec<BotRecord>>;
    /// Returns `false` when the bot is gone or `expected_status` no longer
    /// matches. Writing `status` also refreshes `updated_at`.
    async fn update(&self, id: BotId, patch: BotPatch) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SeaOrmBotStore {
    db: DatabaseConnection,
}

impl SeaOrmBotStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn live() -> sea_orm::Select<bots::Entity> {
        bots::Entity::find().filter(bots::Column::DeletedAt.is_null())
    }

    fn records(rows: Vec<bots::Model>) -> Vec<BotRecord> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id;
                match BotRecord::try_from(row) {
                    Ok(rec) => Some(rec),
                    Err(err) => {
                        tracing::warn!(bot_id = %id, error = %err, "skipping unreadable bot row");
                        None
                    }
                }
            })
            .collect()
    }
}

impl TryFrom<bots::Model> for BotRecord {
    type Error = anyhow::Error;

    fn try_from(row: bots::Model) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BotStatus>()
            .with_context(|| format!("bot {} has unknown status", row.id))?;
        // Unknown health text is treated as healthy; the prober corrects it.
        let health_status = row
            .health_status
            .parse::<HealthStatus>()
            .unwrap_or(HealthStatus::Healthy);

        Ok(Self {
            id: BotId(row.id),
            tenant_id: row.tenant_id,
            hostname: row.hostname,
            container_ref: row.container_ref.filter(|r| !r.is_empty()),
            status,
            health_status,
            last_health_check_at: row.last_health_check_at.map(|t| t.with_timezone(&Utc)),
            gateway_port: row.gateway_port.and_then(|p| u16::try_from(p).ok()),
            image: row.image,
            updated_at: row.updated_at.with_timezone(&Utc),
        })
    }
}

#[async_trait::async_trait]
impl BotStore for SeaOrmBotStore {
    async fn get(&self, id: BotId) -> anyhow::Result<Option<BotRecord>> {
        let row = Self::live()
            .filter(bots::Column::Id.eq(id.0))
            .one(&self.db)
            .await
            .context("load bot")?;
        row.map(BotRecord::try_from).transpose()
    }

    async fn find_by_container_ref(&self, container_ref: &str) -> anyhow::Result<Option<BotRecord>> {
        let row = Self::live()
            .filter(bots::Column::ContainerRef.eq(container_ref))
            .one(&self.db)
            .await
            .context("find bot by container ref")?;
        row.map(BotRecord::try_from).transpose()
    }

    async fn list_active(&self) -> anyhow::Result<Vec<BotRecord>> {
        let rows = Self::live()
            .order_by_asc(bots::Column::CreatedAt)
            .all(&self.db)
            .await
            .context("list bots")?;
        Ok(Self::records(rows))
    }

    async fn list_by_status(&self, status: BotStatus) -> anyhow::Result<Vec<BotRecord>> {
        let rows = Self::live()
            .filter(bots::Column::Status.eq(status.as_str()))
            .all(&self.db)
            .await
            .with_context(|| format!("list {status} bots"))?;
        Ok(Self::records(rows))
    }

    async fn update(&self, id: BotId, patch: BotPatch) -> anyhow::Result<bool> {
        if patch.is_empty() {
            return Ok(true);
        }

        let mut q = bots::Entity::update_many()
            .filter(bots::Column::Id.eq(id.0))
            .filter(bots::Column::DeletedAt.is_null());

        if let Some(expected) = patch.expected_status {
            q = q.filter(bots::Column::Status.eq(expected.as_str()));
        }
        if let Some(status) = patch.status {
            q = q
                .col_expr(bots::Column::Status, Expr::value(status.as_str()))
                .col_expr(bots::Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()));
        }
        if let Some(container_ref) = patch.container_ref {
            q = q.col_expr(bots::Column::ContainerRef, Expr::value(container_ref));
        }
        if let Some(health) = patch.health_status {
            q = q.col_expr(bots::Column::HealthStatus, Expr::value(health.as_str()));
        }
        if let Some(at) = patch.last_health_check_at {
            q = q.col_expr(bots::Column::LastHealthCheckAt, Expr::value(at.fixed_offset()));
        }

        let res = q.exec(&self.db).await.context("update bot")?;
        Ok(res.rows_affected > 0)
    }
}
