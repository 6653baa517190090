use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::crm::session::CrmError;
use crate::crm::types::EntityRecord;
use crate::util::json::get_nested;
use crate::util::time::parse_iso_ts;

/// Fetch one CRM record by kind and id; the real implementation is the
/// authenticated CRM client.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn fetch_entity(&self, kind: &str, id: &str) -> Result<Value, CrmError>;
}

/// Sentinel for a field that is absent from the source structure — a schema
/// anomaly worth surfacing in the output, distinct from a present `null`.
pub fn missing_field(name: &str) -> Value {
    Value::String(format!("¡Missing! {name}"))
}

fn field_or_missing(root: &Value, path: &str, name: &str) -> Value {
    match get_nested(root, path) {
        Some(v) => v.clone(),
        None => missing_field(name),
    }
}

/// Display-ready record for one opportunity chatter item, with the foreign
/// references already resolved. Fields keep their loose typing so a present
/// `null` stays distinguishable from the missing-field sentinel.
#[derive(Debug, Clone)]
pub struct EnrichedDetail {
    pub team: Value,
    pub opportunity_name: Value,
    pub stage: Value,
    pub owner_name: Value,
    pub account_name: Value,
    pub amount: Value,
    pub probability: Value,
    pub avg_hour_price: Value,
    pub close_date: Value,
    pub type_of_sales: Value,
    pub actor_name: Value,
    pub text: Value,
    pub modified_ts: i64,
}

/// Resolves the foreign keys referenced by feed items, one fetch per
/// distinct (kind, id) per run. Failed lookups are memoized too, so a bad
/// id costs one round-trip no matter how many items reference it.
pub struct Enricher<'a> {
    lookup: &'a dyn EntityLookup,
    records: HashMap<(String, String), Option<Value>>,
    opportunities: HashMap<String, Option<EntityRecord>>,
}

impl<'a> Enricher<'a> {
    pub fn new(lookup: &'a dyn EntityLookup) -> Self {
        Self {
            lookup,
            records: HashMap::new(),
            opportunities: HashMap::new(),
        }
    }

    async fn resolve(&mut self, kind: &str, id: &str) -> Result<Value, CrmError> {
        let key = (kind.to_string(), id.to_string());
        if let Some(cached) = self.records.get(&key) {
            return match cached {
                Some(v) => Ok(v.clone()),
                None => Err(CrmError::LookupFailed {
                    kind: kind.to_string(),
                    id: id.to_string(),
                }),
            };
        }
        match self.lookup.fetch_entity(kind, id).await {
            Ok(v) => {
                self.records.insert(key, Some(v.clone()));
                Ok(v)
            }
            Err(err) => {
                self.records.insert(key, None);
                Err(err)
            }
        }
    }

    /// The opportunity record with OwnerName and AccountName denormalized
    /// onto it from the referenced User and Account records.
    pub async fn opportunity(&mut self, id: &str) -> Result<EntityRecord, CrmError> {
        if let Some(cached) = self.opportunities.get(id) {
            return match cached {
                Some(record) => Ok(record.clone()),
                None => Err(CrmError::LookupFailed {
                    kind: "Opportunity".to_string(),
                    id: id.to_string(),
                }),
            };
        }

        let record = match self.denormalize(id).await {
            Ok(record) => record,
            Err(err) => {
                self.opportunities.insert(id.to_string(), None);
                return Err(err);
            }
        };
        self.opportunities.insert(id.to_string(), Some(record.clone()));
        Ok(record)
    }

    async fn denormalize(&mut self, id: &str) -> Result<EntityRecord, CrmError> {
        let raw = self.resolve("Opportunity", id).await?;
        let record = raw
            .as_object()
            .cloned()
            .ok_or_else(|| CrmError::Malformed(format!("Opportunity {id} is not an object")))?;
        self.annotate(record).await
    }

    /// Denormalize OwnerName and AccountName onto a record obtained
    /// elsewhere (the recent-opportunity query returns raw rows).
    pub async fn annotate(&mut self, mut record: EntityRecord) -> Result<EntityRecord, CrmError> {
        let owner_id = record.get("OwnerId").and_then(Value::as_str).map(str::to_string);
        let account_id = record.get("AccountId").and_then(Value::as_str).map(str::to_string);

        let owner_name = match owner_id {
            Some(id) => {
                let owner = self.resolve("User", &id).await?;
                field_or_missing(&owner, "Name", "OwnerName")
            }
            None => missing_field("OwnerName"),
        };
        let account_name = match account_id {
            Some(id) => {
                let account = self.resolve("Account", &id).await?;
                field_or_missing(&account, "Name", "AccountName")
            }
            None => missing_field("AccountName"),
        };
        record.insert("OwnerName".to_string(), owner_name);
        record.insert("AccountName".to_string(), account_name);
        Ok(record)
    }

    /// Build the display record for one opportunity feed item.
    pub async fn detail(&mut self, item: &Value) -> Result<EnrichedDetail, CrmError> {
        let parent_id = get_nested(item, "parent.id")
            .and_then(Value::as_str)
            .ok_or_else(|| CrmError::Malformed("feed item has no parent.id".to_string()))?
            .to_string();
        let op = self.opportunity(&parent_id).await?;
        let op = Value::Object(op);

        let modified_ts = get_nested(item, "modifiedDate")
            .and_then(Value::as_str)
            .and_then(parse_iso_ts)
            .map(|dt| dt.timestamp())
            .unwrap_or_default();

        Ok(EnrichedDetail {
            team: field_or_missing(&op, "Team", "Team"),
            opportunity_name: field_or_missing(&op, "Name", "Name"),
            stage: field_or_missing(&op, "StageName", "StageName"),
            owner_name: field_or_missing(&op, "OwnerName", "OwnerName"),
            account_name: field_or_missing(&op, "AccountName", "AccountName"),
            amount: field_or_missing(&op, "Amount", "Amount"),
            probability: field_or_missing(&op, "Probability", "Probability"),
            avg_hour_price: field_or_missing(&op, "AvgHourPrice", "AvgHourPrice"),
            close_date: field_or_missing(&op, "CloseDate", "CloseDate"),
            type_of_sales: field_or_missing(&op, "TypeOfSales", "TypeOfSales"),
            actor_name: field_or_missing(item, "actor.name", "ActorName"),
            text: field_or_missing(item, "body.text", "BodyText"),
            modified_ts,
        })
    }
}
