use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChangeEvent, FlagStore, Notification, StoreError, Subscription};
use crate::flags::{CacheKey, FlagRecord, Override, TargetingRules};

/// NOTIFY channel written by the `flag_records` trigger.
pub const CHANGE_CHANNEL: &str = "flag_changes";

const SUBSCRIPTION_BUFFER: usize = 256;

// Database row types
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlagRow {
    pub flag_key: String,
    pub environment: String,
    pub enabled: bool,
    pub default_value: bool,
    pub targeting_rules: serde_json::Value,
    pub overrides: serde_json::Value,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

// Rules as written by the admin service; percentage may be out of range
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRules {
    percentage: i64,
    segments: BTreeSet<String>,
    user_ids: BTreeSet<String>,
    excluded_user_ids: BTreeSet<String>,
    countries: BTreeSet<String>,
}

/// Turn a row into a record, clamping the percentage on the way in.
pub fn decode_row(row: FlagRow) -> Result<FlagRecord, StoreError> {
    let key = CacheKey::new(row.flag_key, row.environment);

    if row.version < 1 {
        return Err(StoreError::malformed(
            &key,
            format!("version must be positive, got {}", row.version),
        ));
    }

    let raw: RawRules = match row.targeting_rules {
        serde_json::Value::Null => RawRules::default(),
        value => serde_json::from_value(value)
            .map_err(|e| StoreError::malformed(&key, format!("targeting_rules: {}", e)))?,
    };

    let overrides: BTreeMap<String, Override> = match row.overrides {
        serde_json::Value::Null => BTreeMap::new(),
        value => serde_json::from_value(value)
            .map_err(|e| StoreError::malformed(&key, format!("overrides: {}", e)))?,
    };

    let mut targeting_rules = TargetingRules {
        percentage: TargetingRules::clamp_percentage(raw.percentage),
        segments: raw.segments,
        user_ids: raw.user_ids,
        excluded_user_ids: raw.excluded_user_ids,
        countries: raw.countries,
    };
    targeting_rules.normalize();

    Ok(FlagRecord {
        flag_key: key.flag_key,
        environment: key.environment,
        enabled: row.enabled,
        default_value: row.default_value,
        targeting_rules,
        overrides,
        version: row.version as u64,
        updated_at: row.updated_at,
    })
}

fn map_sqlx_error(key: Option<&CacheKey>, e: sqlx::Error) -> StoreError {
    match (key, e) {
        (Some(key), e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_))) => {
            StoreError::malformed(key, e.to_string())
        }
        (_, e) => StoreError::Unavailable(e.to_string()),
    }
}

/// Postgres-backed store. Writes come from the admin service; a trigger on
/// `flag_records` turns every commit into a NOTIFY on `flag_changes`.
pub struct PgFlagStore {
    pool: PgPool,
}

impl PgFlagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    async fn get(&self, flag_key: &str, environment: &str) -> Result<FlagRecord, StoreError> {
        let key = CacheKey::new(flag_key, environment);

        let row: Option<FlagRow> = sqlx::query_as(
            r#"
            SELECT flag_key, environment, enabled, default_value, targeting_rules, overrides, version, updated_at
            FROM flag_records
            WHERE flag_key = $1 AND environment = $2 AND NOT deleted
            "#,
        )
        .bind(flag_key)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(Some(&key), e))?;

        match row {
            Some(row) => decode_row(row),
            None => Err(StoreError::not_found(&key)),
        }
    }

    async fn list(&self, environment: &str) -> Result<Vec<FlagRecord>, StoreError> {
        let rows: Vec<FlagRow> = sqlx::query_as(
            r#"
            SELECT flag_key, environment, enabled, default_value, targeting_rules, overrides, version, updated_at
            FROM flag_records
            WHERE environment = $1 AND NOT deleted
            ORDER BY flag_key
            "#,
        )
        .bind(environment)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(None, e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_row(row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed flag row"),
            }
        }
        Ok(records)
    }

    async fn subscribe(&self, environment: &str) -> Result<Subscription, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(None, e))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| map_sqlx_error(None, e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let env = environment.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => received,
                };

                let message = match received {
                    Ok(Some(notification)) => {
                        match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                            Ok(event) if event.environment == env => Notification::Changed(event),
                            Ok(_) => continue,
                            Err(e) => {
                                warn!(error = %e, payload = notification.payload(), "ignoring malformed change notification");
                                continue;
                            }
                        }
                    }
                    // connection dropped; the next try_recv reconnects but anything
                    // sent in between is lost
                    Ok(None) => Notification::Gap,
                    Err(e) => {
                        warn!(error = %e, environment = %env, "change listener failed");
                        break;
                    }
                };

                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(environment = %env, "change listener stopped");
        });

        Ok(Subscription::from_channel(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(rules: serde_json::Value, overrides: serde_json::Value, version: i64) -> FlagRow {
        FlagRow {
            flag_key: "checkout-v2".to_string(),
            environment: "prod".to_string(),
            enabled: true,
            default_value: false,
            targeting_rules: rules,
            overrides,
            version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_row() {
        let record = decode_row(row(
            json!({"percentage": 25, "segments": ["beta"], "countries": ["de"]}),
            json!({"user123": {"value": true}}),
            3,
        ))
        .unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.targeting_rules.percentage, 25);
        assert!(record.targeting_rules.segments.contains("beta"));
        assert!(record.targeting_rules.countries.contains("DE"));
        assert!(record.overrides["user123"].value);
    }

    #[test]
    fn test_decode_clamps_percentage() {
        let high = decode_row(row(json!({"percentage": 400}), json!({}), 1)).unwrap();
        assert_eq!(high.targeting_rules.percentage, 100);
        let low = decode_row(row(json!({"percentage": -3}), json!(null), 1)).unwrap();
        assert_eq!(low.targeting_rules.percentage, 0);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            decode_row(row(json!({"segments": "beta"}), json!({}), 1)),
            Err(StoreError::Malformed { .. })
        ));
        assert!(matches!(
            decode_row(row(json!({}), json!({"user123": "yes"}), 1)),
            Err(StoreError::Malformed { .. })
        ));
        assert!(matches!(
            decode_row(row(json!({}), json!({}), 0)),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_trigger_announces_hard_deletes() {
        let migration = include_str!("../../migrations/20250101000000_flag_records.sql");
        assert!(migration.contains("AFTER INSERT OR UPDATE OR DELETE ON flag_records"));
        assert!(migration.contains("'new_version', OLD.version + 1"));

        // shape of the DELETE branch payload
        let event: ChangeEvent = serde_json::from_value(json!({
            "flag_key": "checkout-v2",
            "environment": "prod",
            "new_version": 4
        }))
        .unwrap();
        assert_eq!(event.flag_key.as_deref(), Some("checkout-v2"));
        assert_eq!(event.new_version, 4);
    }
}
