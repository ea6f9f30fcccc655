//! Postgres ledger store.

use crate::models::{
    ConsumptionCompletion, ConsumptionRequest, ConsumptionStatus, LedgerTransaction,
    ListConsumptionFilter, ListTransactionsFilter, NewLedgerTransaction, RechargeOrder, Wallet,
};
use crate::services::cost::CostModel;
use crate::services::error::BillingError;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::posting::{IdempotencyKey, WalletMutation};
use crate::services::store::{LedgerStore, PostOutcome};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const WALLET_COLUMNS: &str = "wallet_id, account_id, balance, free_allowance_remaining, \
     lifetime_spent, lifetime_units_consumed, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, sequence_no, wallet_id, account_id, \
     transaction_type, amount, balance_before, balance_after, free_allowance_before, \
     free_allowance_after, description, external_payment_reference, gateway_order_id, \
     consumption_request_id, created_utc";

const REQUEST_COLUMNS: &str = "request_id, account_id, source_handle, source_format, language, \
     requested_units, estimated_cost, actual_cost, status, result_text, error_message, \
     ledger_transaction_id, settled, settlement_attempts, last_settlement_attempt_utc, \
     created_utc, started_utc, completed_utc";

const ORDER_COLUMNS: &str =
    "gateway_order_id, account_id, amount, currency, status, payment_id, created_utc, paid_utc";

/// SQLSTATEs that mean "another transaction holds the row; try again".
const CONTENTION_CODES: [&str; 3] = ["40P01", "40001", "55P03"];

/// Map a sqlx error, classifying lock contention as retryable.
fn db_error(context: &str, err: sqlx::Error) -> BillingError {
    if let sqlx::Error::Database(ref db_err) = err {
        if let Some(code) = db_err.code() {
            if CONTENTION_CODES.iter().any(|c| *c == code) {
                return BillingError::Contention(format!("{}: {}", context, db_err));
            }
        }
    }
    BillingError::Store(anyhow::anyhow!("Failed to {}: {}", context, err))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Postgres-backed [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "wallet-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, BillingError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| BillingError::Store(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self::from_pool(pool, lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), BillingError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Store(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Begin a transaction whose row-lock waits are bounded.
    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>, BillingError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        // SET does not accept bind parameters.
        let lock_timeout_ms = self.lock_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("set lock timeout", e))?;

        Ok(tx)
    }

    async fn find_by_idempotency_key(
        tx: &mut Transaction<'static, Postgres>,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerTransaction>, BillingError> {
        let result = match key {
            IdempotencyKey::PaymentReference(reference) => {
                sqlx::query_as::<_, LedgerTransaction>(&format!(
                    "SELECT {} FROM ledger_transactions WHERE external_payment_reference = $1",
                    TRANSACTION_COLUMNS
                ))
                .bind(reference)
                .fetch_optional(&mut **tx)
                .await
            }
            IdempotencyKey::ConsumptionRequest(request_id) => {
                sqlx::query_as::<_, LedgerTransaction>(&format!(
                    "SELECT {} FROM ledger_transactions WHERE consumption_request_id = $1",
                    TRANSACTION_COLUMNS
                ))
                .bind(request_id)
                .fetch_optional(&mut **tx)
                .await
            }
        };
        result.map_err(|e| db_error("check idempotency", e))
    }

    async fn insert_transaction(
        tx: &mut Transaction<'static, Postgres>,
        wallet: &Wallet,
        row: &NewLedgerTransaction,
    ) -> Result<LedgerTransaction, sqlx::Error> {
        sqlx::query_as::<_, LedgerTransaction>(&format!(
            r#"
            INSERT INTO ledger_transactions (
                transaction_id, wallet_id, account_id, transaction_type, amount,
                balance_before, balance_after, free_allowance_before, free_allowance_after,
                description, external_payment_reference, gateway_order_id, consumption_request_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(wallet.wallet_id)
        .bind(wallet.account_id)
        .bind(row.transaction_type.as_str())
        .bind(row.amount)
        .bind(row.balance_before)
        .bind(row.balance_after)
        .bind(row.free_allowance_before)
        .bind(row.free_allowance_after)
        .bind(&row.description)
        .bind(&row.external_payment_reference)
        .bind(&row.gateway_order_id)
        .bind(row.consumption_request_id)
        .fetch_one(&mut **tx)
        .await
    }

    async fn current_status(&self, request_id: Uuid) -> Result<String, BillingError> {
        sqlx::query_scalar::<_, String>("SELECT status FROM consumption_requests WHERE request_id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get request status", e))?
            .ok_or(BillingError::RequestNotFound(request_id))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), BillingError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Store(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self, wallet, opening), fields(account_id = %wallet.account_id))]
    async fn create_wallet(
        &self,
        wallet: Wallet,
        opening: NewLedgerTransaction,
    ) -> Result<(Wallet, bool), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_wallet"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        let inserted = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            INSERT INTO wallets (wallet_id, account_id, balance, free_allowance_remaining,
                                 lifetime_spent, lifetime_units_consumed)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id) DO NOTHING
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(wallet.wallet_id)
        .bind(wallet.account_id)
        .bind(wallet.balance)
        .bind(wallet.free_allowance_remaining)
        .bind(wallet.lifetime_spent)
        .bind(wallet.lifetime_units_consumed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("create wallet", e))?;

        let Some(created) = inserted else {
            tx.rollback().await.ok();
            let existing = self
                .get_wallet(wallet.account_id)
                .await?
                .ok_or(BillingError::WalletNotFound(wallet.account_id))?;
            timer.observe_duration();
            return Ok((existing, false));
        };

        Self::insert_transaction(&mut tx, &created, &opening)
            .await
            .map_err(|e| db_error("insert opening transaction", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit wallet creation", e))?;

        timer.observe_duration();

        info!(wallet_id = %created.wallet_id, "Wallet created");

        Ok((created, true))
    }

    #[instrument(skip(self))]
    async fn get_wallet(&self, account_id: Uuid) -> Result<Option<Wallet>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_wallet"])
            .start_timer();

        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE account_id = $1",
            WALLET_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get wallet", e))?;

        timer.observe_duration();

        Ok(wallet)
    }

    #[instrument(skip(self, mutation, cost_model), fields(transaction_type = %mutation.transaction_type()))]
    async fn post(
        &self,
        account_id: Uuid,
        mutation: &WalletMutation,
        cost_model: &CostModel,
    ) -> Result<PostOutcome, BillingError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["post"]).start_timer();

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.begin_locked().await?;

        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE account_id = $1 FOR UPDATE",
            WALLET_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock wallet", e))?
        .ok_or(BillingError::WalletNotFound(account_id))?;

        // Checked under the lock so concurrent duplicates serialize behind us.
        if let Some(key) = mutation.idempotency_key() {
            if let Some(existing) = Self::find_by_idempotency_key(&mut tx, &key).await? {
                tx.rollback().await.ok();
                if existing.account_id != account_id {
                    if let IdempotencyKey::PaymentReference(reference) = key {
                        return Err(BillingError::DuplicatePaymentReference(reference));
                    }
                    return Err(BillingError::ConsistencyViolation(format!(
                        "debit for consumption request already recorded against account {}",
                        existing.account_id
                    )));
                }
                timer.observe_duration();
                return Ok(PostOutcome {
                    wallet,
                    transaction: existing,
                    replayed: true,
                });
            }
        }

        let posting = mutation.apply(&wallet, cost_model)?;

        let updated = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            UPDATE wallets
            SET balance = $2,
                free_allowance_remaining = $3,
                lifetime_spent = $4,
                lifetime_units_consumed = $5,
                updated_utc = NOW()
            WHERE wallet_id = $1
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(wallet.wallet_id)
        .bind(posting.wallet.balance)
        .bind(posting.wallet.free_allowance_remaining)
        .bind(posting.wallet.lifetime_spent)
        .bind(posting.wallet.lifetime_units_consumed)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("update wallet", e))?;

        let transaction = match Self::insert_transaction(&mut tx, &updated, &posting.transaction).await {
            Ok(inserted) => inserted,
            Err(e) if is_unique_violation(&e) => {
                // Same key committed through another wallet's lock.
                tx.rollback().await.ok();
                warn!(error = %e, "Idempotency key collision across wallets");
                return match mutation.idempotency_key() {
                    Some(IdempotencyKey::PaymentReference(reference)) => {
                        Err(BillingError::DuplicatePaymentReference(reference))
                    }
                    _ => Err(BillingError::ConsistencyViolation(format!(
                        "duplicate ledger key: {}",
                        e
                    ))),
                };
            }
            Err(e) => return Err(db_error("insert ledger transaction", e)),
        };

        tx.commit()
            .await
            .map_err(|e| db_error("commit posting", e))?;

        timer.observe_duration();

        Ok(PostOutcome {
            wallet: updated,
            transaction,
            replayed: false,
        })
    }

    #[instrument(skip(self, filter))]
    async fn list_transactions(
        &self,
        account_id: Uuid,
        filter: &ListTransactionsFilter,
    ) -> Result<Vec<LedgerTransaction>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, LedgerTransaction>(&format!(
            r#"
            SELECT {}
            FROM ledger_transactions
            WHERE account_id = $1
              AND ($2::varchar IS NULL OR transaction_type = $2)
              AND ($3::timestamptz IS NULL OR created_utc >= $3)
              AND ($4::timestamptz IS NULL OR created_utc <= $4)
              AND ($5::bigint IS NULL OR sequence_no < $5)
            ORDER BY sequence_no DESC
            LIMIT $6
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .bind(filter.transaction_type.map(|t| t.as_str()))
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(filter.page_token)
        .bind(filter.limit())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list transactions", e))?;

        timer.observe_duration();

        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn all_transactions(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<LedgerTransaction>, BillingError> {
        sqlx::query_as::<_, LedgerTransaction>(&format!(
            "SELECT {} FROM ledger_transactions WHERE account_id = $1 ORDER BY sequence_no ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("replay transactions", e))
    }

    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    async fn insert_consumption_request(
        &self,
        request: &ConsumptionRequest,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            INSERT INTO consumption_requests (
                request_id, account_id, source_handle, source_format, language,
                requested_units, estimated_cost, status, settled, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(request.request_id)
        .bind(request.account_id)
        .bind(&request.source_handle)
        .bind(&request.source_format)
        .bind(&request.language)
        .bind(request.requested_units)
        .bind(request.estimated_cost)
        .bind(&request.status)
        .bind(request.settled)
        .bind(request.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("insert consumption request", e))?;
        Ok(())
    }

    async fn get_consumption_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ConsumptionRequest>, BillingError> {
        sqlx::query_as::<_, ConsumptionRequest>(&format!(
            "SELECT {} FROM consumption_requests WHERE request_id = $1",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get consumption request", e))
    }

    #[instrument(skip(self))]
    async fn mark_in_progress(&self, request_id: Uuid) -> Result<ConsumptionRequest, BillingError> {
        let updated = sqlx::query_as::<_, ConsumptionRequest>(&format!(
            r#"
            UPDATE consumption_requests
            SET status = 'in_progress', started_utc = NOW()
            WHERE request_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("mark request in progress", e))?;

        match updated {
            Some(request) => Ok(request),
            None => Err(BillingError::InvalidTransition {
                from: self.current_status(request_id).await?,
                to: ConsumptionStatus::InProgress,
            }),
        }
    }

    #[instrument(skip(self, completion), fields(status = %completion.status()))]
    async fn complete_consumption_request(
        &self,
        request_id: Uuid,
        completion: &ConsumptionCompletion,
    ) -> Result<ConsumptionRequest, BillingError> {
        let updated = match completion {
            ConsumptionCompletion::Completed {
                result_text,
                actual_cost,
                ledger_transaction_id,
                settled,
            } => {
                sqlx::query_as::<_, ConsumptionRequest>(&format!(
                    r#"
                    UPDATE consumption_requests
                    SET status = 'completed', result_text = $2, actual_cost = $3,
                        ledger_transaction_id = $4, settled = $5, error_message = NULL,
                        completed_utc = NOW()
                    WHERE request_id = $1 AND status = 'in_progress'
                    RETURNING {}
                    "#,
                    REQUEST_COLUMNS
                ))
                .bind(request_id)
                .bind(result_text)
                .bind(actual_cost)
                .bind(ledger_transaction_id)
                .bind(settled)
                .fetch_optional(&self.pool)
                .await
            }
            ConsumptionCompletion::Failed { error_message } => {
                sqlx::query_as::<_, ConsumptionRequest>(&format!(
                    r#"
                    UPDATE consumption_requests
                    SET status = 'failed', error_message = $2, actual_cost = NULL,
                        completed_utc = NOW()
                    WHERE request_id = $1 AND status = 'in_progress'
                    RETURNING {}
                    "#,
                    REQUEST_COLUMNS
                ))
                .bind(request_id)
                .bind(error_message)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| db_error("complete consumption request", e))?;

        match updated {
            Some(request) => Ok(request),
            None => Err(BillingError::InvalidTransition {
                from: self.current_status(request_id).await?,
                to: completion.status(),
            }),
        }
    }

    #[instrument(skip(self, filter))]
    async fn list_consumption_requests(
        &self,
        account_id: Uuid,
        filter: &ListConsumptionFilter,
    ) -> Result<Vec<ConsumptionRequest>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_consumption_requests"])
            .start_timer();

        let requests = sqlx::query_as::<_, ConsumptionRequest>(&format!(
            r#"
            SELECT {}
            FROM consumption_requests
            WHERE account_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::varchar IS NULL OR language = $3)
              AND ($4::timestamptz IS NULL OR created_utc >= $4)
              AND ($5::timestamptz IS NULL OR created_utc <= $5)
            ORDER BY created_utc DESC
            LIMIT $6
            "#,
            REQUEST_COLUMNS
        ))
        .bind(account_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.language.map(|l| l.as_str()))
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(filter.limit())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list consumption requests", e))?;

        timer.observe_duration();

        Ok(requests)
    }

    async fn list_unsettled(&self, limit: i64) -> Result<Vec<ConsumptionRequest>, BillingError> {
        sqlx::query_as::<_, ConsumptionRequest>(&format!(
            r#"
            SELECT {}
            FROM consumption_requests
            WHERE status = 'completed' AND settled = FALSE
            ORDER BY last_settlement_attempt_utc ASC NULLS FIRST, completed_utc ASC
            LIMIT $1
            "#,
            REQUEST_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list unsettled requests", e))
    }

    #[instrument(skip(self))]
    async fn record_settlement_failure(&self, request_id: Uuid) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            UPDATE consumption_requests
            SET settlement_attempts = settlement_attempts + 1,
                last_settlement_attempt_utc = NOW()
            WHERE request_id = $1 AND status = 'completed' AND settled = FALSE
            "#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record settlement failure", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_settled(
        &self,
        request_id: Uuid,
        ledger_transaction_id: Uuid,
        actual_cost: Decimal,
    ) -> Result<ConsumptionRequest, BillingError> {
        sqlx::query_as::<_, ConsumptionRequest>(&format!(
            r#"
            UPDATE consumption_requests
            SET ledger_transaction_id = $2, actual_cost = $3, settled = TRUE
            WHERE request_id = $1 AND status = 'completed'
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .bind(ledger_transaction_id)
        .bind(actual_cost)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("mark request settled", e))?
        .ok_or_else(|| {
            BillingError::InvalidRequest("Only completed requests can be settled".to_string())
        })
    }

    #[instrument(skip(self, order), fields(order_id = %order.gateway_order_id))]
    async fn insert_recharge_order(&self, order: &RechargeOrder) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            INSERT INTO recharge_orders (gateway_order_id, account_id, amount, currency, status, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&order.gateway_order_id)
        .bind(order.account_id)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(&order.status)
        .bind(order.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::InvalidRequest("Recharge order already exists".to_string())
            } else {
                db_error("insert recharge order", e)
            }
        })?;
        Ok(())
    }

    async fn get_recharge_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<RechargeOrder>, BillingError> {
        sqlx::query_as::<_, RechargeOrder>(&format!(
            "SELECT {} FROM recharge_orders WHERE gateway_order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get recharge order", e))
    }

    #[instrument(skip(self))]
    async fn mark_recharge_order_paid(
        &self,
        gateway_order_id: &str,
        payment_id: &str,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            UPDATE recharge_orders
            SET status = 'paid', payment_id = $2, paid_utc = NOW()
            WHERE gateway_order_id = $1 AND status = 'created'
            "#,
        )
        .bind(gateway_order_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark recharge order paid", e))?;
        Ok(())
    }
}
