//! Database layer: pool setup, migrations and the SQLite ledger store.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{Result, SettlementError};
use crate::models::{
    NewInvestment, NewReconciliationItem, NewTransaction, Project, ReconciliationItem, SlotState,
    TransactionRecord, User, VerificationRequest,
};
use crate::store::{LedgerStore, StoreResult};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// [`LedgerStore`] backed by the service's SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl LedgerStore for SqliteStore {
    // ─────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, is_active, wallet_balance, referrer_id FROM users WHERE id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn activate_user(&self, user_id: &str) -> StoreResult<()> {
        let rows = sqlx::query("UPDATE users SET is_active = 1 WHERE id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(SettlementError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn credit_wallet(&self, user_id: &str, amount: i64) -> StoreResult<()> {
        let rows = sqlx::query("UPDATE users SET wallet_balance = wallet_balance + ?1 WHERE id = ?2")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(SettlementError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Projects
    // ─────────────────────────────────────────────────────────

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, slot_price, total_slots, filled_slots, status
            FROM   projects
            WHERE  id = ?1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    async fn compare_and_set_project(
        &self,
        project_id: &str,
        expected: SlotState,
        next: SlotState,
    ) -> StoreResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE projects
            SET    filled_slots = ?1, status = ?2
            WHERE  id = ?3 AND filled_slots = ?4 AND status = ?5
            "#,
        )
        .bind(next.filled_slots)
        .bind(next.status)
        .bind(project_id)
        .bind(expected.filled_slots)
        .bind(expected.status)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    // ─────────────────────────────────────────────────────────
    // Append-only records
    // ─────────────────────────────────────────────────────────

    async fn append_transaction(&self, tx: NewTransaction) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (user_id, kind, amount, provider_ref, referred_user_id,
                 project_id, slots, method, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'completed', ?9)
            "#,
        )
        .bind(&tx.user_id)
        .bind(tx.kind)
        .bind(tx.amount)
        .bind(&tx.provider_ref)
        .bind(&tx.referred_user_id)
        .bind(&tx.project_id)
        .bind(tx.slots)
        .bind(tx.method)
        .bind(now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                SettlementError::DuplicateEvent(tx.provider_ref.unwrap_or_default()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_investment(&self, investment: NewInvestment) -> StoreResult<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO investments (user_id, project_id, amount, slots, method, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'completed', ?6)
            "#,
        )
        .bind(&investment.user_id)
        .bind(&investment.project_id)
        .bind(investment.amount)
        .bind(investment.slots)
        .bind(investment.method)
        .bind(now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn find_completed_transaction(
        &self,
        provider_ref: &str,
    ) -> StoreResult<Option<TransactionRecord>> {
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, user_id, kind, amount, provider_ref, referred_user_id,
                   project_id, slots, method, status, created_at
            FROM   transactions
            WHERE  provider_ref = ?1 AND status = 'completed'
            LIMIT  1
            "#,
        )
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────
    // Verification requests
    // ─────────────────────────────────────────────────────────

    async fn get_verification_request(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<VerificationRequest>> {
        let request = sqlx::query_as::<_, VerificationRequest>(
            r#"
            SELECT id, user_id, kind, project_id, amount, status
            FROM   verification_requests
            WHERE  id = ?1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request)
    }

    async fn mark_request_approved(&self, request_id: &str) -> StoreResult<bool> {
        let rows = sqlx::query(
            "UPDATE verification_requests SET status = 'approved' WHERE id = ?1 AND status = 'pending'",
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    // ─────────────────────────────────────────────────────────
    // Reconciliation log
    // ─────────────────────────────────────────────────────────

    async fn append_reconciliation(&self, item: NewReconciliationItem) -> StoreResult<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO reconciliation_items
                (kind, user_id, project_id, provider_ref, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(item.kind)
        .bind(&item.user_id)
        .bind(&item.project_id)
        .bind(&item.provider_ref)
        .bind(&item.detail)
        .bind(now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn list_reconciliation(&self, limit: i64) -> StoreResult<Vec<ReconciliationItem>> {
        let rows = sqlx::query_as::<_, ReconciliationItem>(
            r#"
            SELECT id, kind, user_id, project_id, provider_ref, detail, created_at
            FROM   reconciliation_items
            ORDER  BY id DESC
            LIMIT  ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ─────────────────────────────────────────────────────────
// Test fixtures
// ─────────────────────────────────────────────────────────
