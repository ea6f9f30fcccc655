//! Unified account history: ledger transactions and consumption requests
//! merged newest first.

use crate::models::{
    ConsumptionRequest, ConsumptionStatus, Language, LedgerTransaction, ListConsumptionFilter,
    ListTransactionsFilter, TransactionType,
};
use crate::services::error::BillingError;
use crate::services::store::LedgerStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Transaction,
    Transcription,
}

impl HistoryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transaction" | "transactions" => Some(Self::Transaction),
            "transcription" | "transcriptions" => Some(Self::Transcription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Transaction(LedgerTransaction),
    Transcription(ConsumptionRequest),
}

impl HistoryEntry {
    pub fn occurred_utc(&self) -> DateTime<Utc> {
        match self {
            Self::Transaction(t) => t.created_utc,
            Self::Transcription(r) => r.created_utc,
        }
    }
}

/// Transaction filters apply to transactions only; status and language apply
/// to transcriptions only. Dates apply to both.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kind: Option<HistoryKind>,
    pub transaction_type: Option<TransactionType>,
    pub status: Option<ConsumptionStatus>,
    pub language: Option<Language>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl HistoryFilter {
    fn limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(100)
        }
    }

    fn wants(&self, kind: HistoryKind) -> bool {
        self.kind.map_or(true, |k| k == kind)
    }
}

pub async fn account_history(
    store: &dyn LedgerStore,
    account_id: Uuid,
    filter: &HistoryFilter,
) -> Result<Vec<HistoryEntry>, BillingError> {
    let limit = filter.limit();
    let mut entries = Vec::new();

    if filter.wants(HistoryKind::Transaction) {
        let transactions = store
            .list_transactions(
                account_id,
                &ListTransactionsFilter {
                    transaction_type: filter.transaction_type,
                    date_from: filter.date_from,
                    date_to: filter.date_to,
                    page_size: limit as i32,
                    page_token: None,
                },
            )
            .await?;
        entries.extend(transactions.into_iter().map(HistoryEntry::Transaction));
    }

    if filter.wants(HistoryKind::Transcription) {
        let requests = store
            .list_consumption_requests(
                account_id,
                &ListConsumptionFilter {
                    status: filter.status,
                    language: filter.language,
                    date_from: filter.date_from,
                    date_to: filter.date_to,
                    limit,
                },
            )
            .await?;
        entries.extend(requests.into_iter().map(HistoryEntry::Transcription));
    }

    merge_newest_first(&mut entries, limit as usize);
    Ok(entries)
}

fn merge_newest_first(entries: &mut Vec<HistoryEntry>, limit: usize) {
    entries.sort_by(|a, b| b.occurred_utc().cmp(&a.occurred_utc()));
    entries.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(HistoryKind::parse("transactions"), Some(HistoryKind::Transaction));
        assert_eq!(HistoryKind::parse("transcription"), Some(HistoryKind::Transcription));
        assert_eq!(HistoryKind::parse("refunds"), None);
    }

    #[test]
    fn test_filter_limit_defaults_and_caps() {
        assert_eq!(HistoryFilter::default().limit(), 50);
        let capped = HistoryFilter {
            limit: 1000,
            ..Default::default()
        };
        assert_eq!(capped.limit(), 100);
    }
}
