//! New Relic usage, consumption and license data over NerdGraph.
//!
//! Every query has its own response structs. A field the structs require but
//! the response lacks is a decode error, never a silently skipped row.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    time::Duration,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::Provider;
use crate::{
    error::{PartialDataWarning, ProviderError},
    model::{CostRecord, DATE_FORMAT, DateRange, UsageRecord},
    table::truncate_str,
};

const PROVIDER: &str = "newrelic";
const US_ENDPOINT: &str = "https://api.newrelic.com/graphql";
const EU_ENDPOINT: &str = "https://api.eu.newrelic.com/graphql";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ACTIVE_WINDOW_DAYS: i64 = 30;
pub const DEFAULT_INACTIVE_DAYS: u32 = 30;
pub const LICENSE_SECTION_TITLE: &str = "License Usage Details";

const ACCOUNTS_QUERY: &str = "{ actor { accounts { id name } } }";

const NRQL_QUERY: &str = "query($accountId: Int!, $nrql: Nrql!) { \
    actor { account(id: $accountId) { nrql(query: $nrql) { results } } } }";

const AUTH_DOMAINS_QUERY: &str = "{ actor { organization { authorizationManagement { \
    authenticationDomains { authenticationDomains { id } } } } } }";

const USERS_QUERY: &str = "query($domainId: [ID!]) { actor { organization { userManagement { \
    authenticationDomains(id: $domainId) { authenticationDomains { users { users { \
    id name email lastActive type { displayName id } } } } } } } } }";

#[derive(Debug, Clone, Default)]
pub struct NewRelicSettings {
    pub api_key: Option<String>,
    pub account_id: Option<i64>,
    pub region: Option<String>,
    pub inactive_days: Option<u32>,
}

#[derive(Serialize)]
struct GraphQLRequest<'a, V: Serialize> {
    query: &'a str,
    variables: V,
}

#[derive(Debug, Deserialize)]
struct GraphQLResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccountsData {
    actor: AccountsActor,
}

#[derive(Debug, Deserialize)]
struct AccountsActor {
    accounts: Vec<Account>,
}

#[derive(Debug, Clone, Deserialize)]
struct Account {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct NrqlData<R> {
    actor: NrqlActor<R>,
}

#[derive(Debug, Deserialize)]
struct NrqlActor<R> {
    account: NrqlAccount<R>,
}

#[derive(Debug, Deserialize)]
struct NrqlAccount<R> {
    nrql: NrqlResults<R>,
}

#[derive(Debug, Deserialize)]
struct NrqlResults<R> {
    results: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct DataSizeRow {
    #[serde(rename = "productLine")]
    product_line: String,
    #[serde(rename = "sum.newRelicDbSize")]
    size_gb: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumptionRow {
    product_line: String,
    cost: f64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    metric: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthDomainsData {
    actor: AuthDomainsActor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthDomainsActor {
    organization: AuthDomainsOrganization,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthDomainsOrganization {
    authorization_management: AuthorizationManagement,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationManagement {
    authentication_domains: DomainList<DomainId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainList<T> {
    authentication_domains: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DomainId {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersData {
    actor: UsersActor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersActor {
    organization: UsersOrganization,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersOrganization {
    user_management: UserManagement,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserManagement {
    authentication_domains: DomainList<DomainUsers>,
}

#[derive(Debug, Deserialize)]
struct DomainUsers {
    users: UserPage,
}

#[derive(Debug, Deserialize)]
struct UserPage {
    users: Vec<NerdGraphUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NerdGraphUser {
    id: String,
    name: String,
    email: String,
    #[serde(default)]
    last_active: Option<String>,
    #[serde(default, rename = "type")]
    user_type: Option<UserType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserType {
    #[serde(default)]
    display_name: Option<String>,
}

/// One seat holder and the license tier they occupy.
#[derive(Debug, Clone, PartialEq)]
struct UserLicense {
    name: String,
    email: String,
    license_type: String,
    last_active: Option<DateTime<Utc>>,
}

impl From<NerdGraphUser> for UserLicense {
    fn from(user: NerdGraphUser) -> Self {
        let license_type = user
            .user_type
            .and_then(|t| t.display_name)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "User".to_string());
        let last_active = user.last_active.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| debug!(user = %user.id, raw, error = %e, "unparsable lastActive"))
                .ok()
        });
        UserLicense {
            name: user.name,
            email: user.email,
            license_type,
            last_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LicenseInfo {
    license_type: String,
    total: usize,
    used: usize,
    utilization_pct: f64,
}

/// Monthly list price per seat; unknown tiers cost nothing.
fn license_price(license_type: &str) -> f64 {
    match license_type {
        "User" => 99.0,
        "Full platform" => 199.0,
        "Basic" => 49.0,
        "Core" => 499.0,
        "LimitedAccess" => 29.0,
        _ => 0.0,
    }
}

struct NerdGraphClient {
    endpoint: &'static str,
    api_key: String,
}

impl NerdGraphClient {
    fn query<V: Serialize, T: DeserializeOwned>(
        &self,
        context: &str,
        query: &str,
        variables: V,
    ) -> Result<T, ProviderError> {
        debug!(context, "NerdGraph request");
        let response = ureq::post(self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .set("API-Key", &self.api_key)
            .send_json(GraphQLRequest { query, variables });

        let response = match response {
            Ok(r) => r,
            Err(ureq::Error::Status(code, r)) => {
                let body = r.into_string().unwrap_or_default();
                return Err(ProviderError::query(
                    PROVIDER,
                    context,
                    anyhow::anyhow!("HTTP {code}: {body}"),
                ));
            }
            Err(e) => return Err(ProviderError::query(PROVIDER, context, e)),
        };

        let envelope: GraphQLResponse = response
            .into_json()
            .map_err(|e| ProviderError::decode(PROVIDER, context, e))?;
        decode_response(context, envelope)
    }
}

fn decode_response<T: DeserializeOwned>(
    context: &str,
    envelope: GraphQLResponse,
) -> Result<T, ProviderError> {
    if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        return Err(ProviderError::query(
            PROVIDER,
            context,
            anyhow::anyhow!("GraphQL errors: {}", messages.join(", ")),
        ));
    }
    let data = envelope.data.ok_or_else(|| {
        ProviderError::decode(PROVIDER, context, anyhow::anyhow!("no data in GraphQL response"))
    })?;
    serde_json::from_value(data).map_err(|e| ProviderError::decode(PROVIDER, context, e))
}

pub struct NewRelicProvider {
    client: NerdGraphClient,
    account_filter: Option<i64>,
    inactive_days: u32,
    accounts: RefCell<Option<Vec<Account>>>,
    users: RefCell<Option<Vec<UserLicense>>>,
}

impl NewRelicProvider {
    pub fn new(settings: &NewRelicSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::configuration(
                    PROVIDER,
                    "API key is required (newrelic.api_key or NEW_RELIC_API_KEY)",
                )
            })?;
        let endpoint = endpoint_for(settings.region.as_deref());
        info!(endpoint, "using NerdGraph endpoint");

        Ok(NewRelicProvider {
            client: NerdGraphClient { endpoint, api_key },
            account_filter: settings.account_id,
            inactive_days: settings.inactive_days.unwrap_or(DEFAULT_INACTIVE_DAYS),
            accounts: RefCell::new(None),
            users: RefCell::new(None),
        })
    }

    fn accounts(&self) -> Result<Vec<Account>, ProviderError> {
        if let Some(cached) = self.accounts.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let data: AccountsData = self.client.query("accounts", ACCOUNTS_QUERY, json!({}))?;
        let accounts: Vec<Account> = data
            .actor
            .accounts
            .into_iter()
            .filter(|a| self.account_filter.is_none_or(|id| a.id == id))
            .collect();
        info!(accounts = accounts.len(), "resolved New Relic accounts");
        *self.accounts.borrow_mut() = Some(accounts.clone());
        Ok(accounts)
    }

    fn nrql<R: DeserializeOwned>(&self, account: &Account, nrql: &str) -> Result<Vec<R>, ProviderError> {
        let context = format!("NRQL for account {}", account.id);
        let data: NrqlData<R> = self.client.query(
            &context,
            NRQL_QUERY,
            json!({ "accountId": account.id, "nrql": nrql }),
        )?;
        Ok(data.actor.account.nrql.results)
    }

    fn users(&self) -> Result<Vec<UserLicense>, ProviderError> {
        if let Some(cached) = self.users.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let domains: AuthDomainsData =
            self.client
                .query("authentication domains", AUTH_DOMAINS_QUERY, json!({}))?;

        let mut users = Vec::new();
        for domain in domains
            .actor
            .organization
            .authorization_management
            .authentication_domains
            .authentication_domains
        {
            let data: UsersData = self.client.query(
                &format!("users of domain {}", domain.id),
                USERS_QUERY,
                json!({ "domainId": [domain.id] }),
            )?;
            for found in data.actor.organization.user_management.authentication_domains.authentication_domains {
                users.extend(found.users.users.into_iter().map(UserLicense::from));
            }
        }
        info!(users = users.len(), "loaded license holders");
        *self.users.borrow_mut() = Some(users.clone());
        Ok(users)
    }

    fn data_size_usage(&self, range: &DateRange) -> Result<Vec<UsageRecord>, ProviderError> {
        let query = data_size_query(range);
        let mut records = Vec::new();
        for account in self.accounts()? {
            let rows: Vec<DataSizeRow> = self.nrql(&account, &query)?;
            records.extend(rows.into_iter().map(|row| UsageRecord {
                service: row.product_line,
                metric: "DataSize".to_string(),
                value: row.size_gb,
                unit: "GB".to_string(),
                timestamp: day_start(range.start),
                metadata: account_metadata(&account),
            }));
        }
        Ok(records)
    }

    fn consumption_costs(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError> {
        let query = consumption_query(range);
        let mut records = Vec::new();
        for account in self.accounts()? {
            let rows: Vec<ConsumptionRow> = self.nrql(&account, &query)?;
            records.extend(rows.into_iter().map(|row| consumption_record(row, &account, range)));
        }
        Ok(records)
    }

    fn license_costs(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError> {
        let accounts = self.accounts()?;
        let summary = license_summary(&self.users()?, Utc::now());
        Ok(license_cost_records(&summary, accounts.first(), range))
    }
}

/// `SINCE ... UNTIL ...` covering every day of the range; NRQL's `UNTIL` is exclusive.
fn nrql_window(range: &DateRange) -> String {
    format!(
        "SINCE '{}' UNTIL '{}'",
        range.start.format(DATE_FORMAT),
        range.end_exclusive().format(DATE_FORMAT)
    )
}

fn data_size_query(range: &DateRange) -> String {
    format!(
        "SELECT sum(newRelicDbSize) FROM NrDailyUsage {} FACET productLine",
        nrql_window(range)
    )
}

fn consumption_query(range: &DateRange) -> String {
    format!(
        "SELECT latest(totalAmount) AS cost, latest(unit) AS unit, latest(productLine) AS productLine, \
         latest(usageMetric) AS metric FROM NrConsumption {} FACET productLine, usageMetric",
        nrql_window(range)
    )
}

impl Provider for NewRelicProvider {
    fn name(&self) -> &'static str {
        "New Relic"
    }

    fn usage_data(&self, range: &DateRange) -> Result<Vec<UsageRecord>, ProviderError> {
        let mut records = self.data_size_usage(range)?;
        let now = Utc::now();
        match self.users() {
            Ok(users) => records.extend(license_usage_records(&license_summary(&users, now), now)),
            Err(err) => PartialDataWarning::new(PROVIDER, "license usage", err).emit(),
        }
        Ok(records)
    }

    fn cost_data(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError> {
        let mut records = self.consumption_costs(range)?;
        match self.license_costs(range) {
            Ok(licenses) => records.extend(licenses),
            Err(err) => PartialDataWarning::new(PROVIDER, "license costs", err).emit(),
        }
        Ok(records)
    }

    fn custom_sections(&self, _range: &DateRange) -> Result<Vec<(String, String)>, ProviderError> {
        let users = self.users()?;
        let body = license_report(&users, self.inactive_days, Utc::now());
        Ok(vec![(LICENSE_SECTION_TITLE.to_string(), body)])
    }
}

fn endpoint_for(region: Option<&str>) -> &'static str {
    match region.map(str::trim) {
        Some(r) if r.eq_ignore_ascii_case("eu") => EU_ENDPOINT,
        _ => US_ENDPOINT,
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn account_metadata(account: &Account) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("accountId".to_string(), Value::from(account.id.to_string())),
        ("accountName".to_string(), Value::from(account.name.as_str())),
    ])
}

fn consumption_record(row: ConsumptionRow, account: &Account, range: &DateRange) -> CostRecord {
    let metric = row.metric.filter(|m| !m.is_empty()).unwrap_or_else(|| "Usage".to_string());
    let unit = row.unit.filter(|u| !u.is_empty()).unwrap_or_else(|| "Count".to_string());
    CostRecord {
        description: Some(format!("{} - {} ({})", row.product_line, metric, account.name)),
        service: row.product_line,
        item_name: metric,
        cost: row.cost,
        currency: "USD".to_string(),
        period: "Monthly".to_string(),
        start_time: day_start(range.start),
        end_time: day_start(range.end),
        account_id: account.id.to_string(),
        region: None,
        quantity: None,
        usage_unit: Some(unit),
    }
}

fn is_active(user: &UserLicense, now: DateTime<Utc>, window_days: i64) -> bool {
    user.last_active
        .is_some_and(|t| now.signed_duration_since(t) <= chrono::Duration::days(window_days))
}

/// Seats per license tier, ordered by tier name.
fn license_summary(users: &[UserLicense], now: DateTime<Utc>) -> Vec<LicenseInfo> {
    let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for user in users {
        let entry = counts.entry(user.license_type.as_str()).or_default();
        entry.0 += 1;
        if is_active(user, now, ACTIVE_WINDOW_DAYS) {
            entry.1 += 1;
        }
    }
    counts
        .into_iter()
        .map(|(license_type, (total, used))| LicenseInfo {
            license_type: license_type.to_string(),
            total,
            used,
            utilization_pct: used as f64 / total as f64 * 100.0,
        })
        .collect()
}

fn license_usage_records(summary: &[LicenseInfo], now: DateTime<Utc>) -> Vec<UsageRecord> {
    summary
        .iter()
        .map(|info| UsageRecord {
            service: "Licenses".to_string(),
            metric: format!("{} Licenses", info.license_type),
            value: info.used as f64,
            unit: "Users".to_string(),
            timestamp: now,
            metadata: BTreeMap::from([
                ("totalLicenses".to_string(), Value::from(info.total)),
                ("utilizationPct".to_string(), Value::from(info.utilization_pct)),
            ]),
        })
        .collect()
}

fn license_cost_records(
    summary: &[LicenseInfo],
    account: Option<&Account>,
    range: &DateRange,
) -> Vec<CostRecord> {
    let (account_id, account_name) = match account {
        Some(a) => (a.id.to_string(), a.name.clone()),
        None => ("unknown".to_string(), "Unknown Account".to_string()),
    };
    summary
        .iter()
        .map(|info| CostRecord {
            service: "Licenses".to_string(),
            item_name: format!("{} Licenses", info.license_type),
            cost: info.used as f64 * license_price(&info.license_type),
            currency: "USD".to_string(),
            period: "Monthly".to_string(),
            start_time: day_start(range.start),
            end_time: day_start(range.end),
            account_id: account_id.clone(),
            region: None,
            quantity: Some(info.used as f64),
            usage_unit: Some("Users".to_string()),
            description: Some(format!(
                "{} Licenses ({}/{} used) - Account: {}",
                info.license_type, info.used, info.total, account_name
            )),
        })
        .collect()
}

/// Per-user license activity with the savings from reclaiming idle seats.
fn license_report(users: &[UserLicense], inactive_days: u32, now: DateTime<Utc>) -> String {
    let mut rows: Vec<(&UserLicense, bool, f64)> = users
        .iter()
        .map(|u| {
            (
                u,
                is_active(u, now, i64::from(inactive_days)),
                license_price(&u.license_type),
            )
        })
        .collect();

    let total_cost: f64 = rows.iter().map(|r| r.2).sum();
    let inactive: Vec<_> = rows.iter().filter(|r| !r.1).collect();
    let savings: f64 = inactive.iter().map(|r| r.2).sum();
    let inactive_count = inactive.len();

    let mut out = String::new();
    out.push_str("License Usage Report for New Relic\n");
    out.push_str(&format!("Date: {}\n\n", now.format(DATE_FORMAT)));
    out.push_str("Summary:\n");
    out.push_str(&format!("  Total Users: {}\n", rows.len()));
    out.push_str(&format!("  Active Users: {}\n", rows.len() - inactive_count));
    out.push_str(&format!(
        "  Inactive Users (>{inactive_days} days): {inactive_count}\n"
    ));
    out.push_str(&format!("  Total License Cost: ${total_cost:.2}\n"));
    out.push_str(&format!("  Potential Monthly Savings: ${savings:.2}\n\n"));

    let mut by_type: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for (user, active, _) in &rows {
        let entry = by_type.entry(user.license_type.as_str()).or_default();
        entry.0 += 1;
        if !active {
            entry.1 += 1;
        }
    }

    out.push_str("License Type Breakdown:\n");
    out.push_str(&format!(
        "{:<16}| {:<5} | {:<8} | {:<16} | {}\n",
        "TYPE", "TOTAL", "INACTIVE", "COST PER LICENSE", "POTENTIAL SAVINGS"
    ));
    out.push_str(&format!("{}\n", "-".repeat(74)));
    for (license_type, (total, idle)) in &by_type {
        let price = license_price(license_type);
        out.push_str(&format!(
            "{:<16}| {:<5} | {:<8} | ${:<15.2} | ${:.2}\n",
            truncate_str(license_type, 16),
            total,
            idle,
            price,
            *idle as f64 * price
        ));
    }
    out.push('\n');

    rows.sort_by(|a, b| {
        a.1.cmp(&b.1)
            .then_with(|| a.0.license_type.cmp(&b.0.license_type))
            .then_with(|| a.0.name.cmp(&b.0.name))
    });

    out.push_str("Detailed License Usage:\n");
    out.push_str(&format!(
        "{:<16}| {:<22}| {:<16}| {:<19} | {:<8} | {}\n",
        "USERNAME", "EMAIL", "LICENSE TYPE", "LAST ACTIVE", "STATUS", "COST"
    ));
    out.push_str(&format!("{}\n", "-".repeat(100)));
    for (user, active, price) in &rows {
        let last_active = user
            .last_active
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:<16}| {:<22}| {:<16}| {:<19} | {:<8} | ${:.2}\n",
            truncate_str(&user.name, 16),
            truncate_str(&user.email, 22),
            truncate_str(&user.license_type, 16),
            last_active,
            if *active { "Active" } else { "Inactive" },
            price
        ));
    }
    out
}
