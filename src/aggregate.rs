//! Groups cost records into account and day buckets with running totals.
//!
//! Accounts come out in lexicographic order and days chronologically, so every
//! renderer walks the same deterministic structure. Each level keeps its totals
//! split by currency as well as the plain sum, so mixed-currency runs can be
//! shown per currency instead of as one misleading figure.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::CostRecord;

/// Label used when a bucket holds more than one currency.
pub const MIXED_CURRENCY: &str = "MIXED";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CurrencyTotals(BTreeMap<String, f64>);

impl CurrencyTotals {
    fn add(&mut self, currency: &str, amount: f64) {
        *self.0.entry(currency.to_string()).or_insert(0.0) += amount;
    }

    fn merge(&mut self, other: &CurrencyTotals) {
        for (currency, amount) in &other.0 {
            self.add(currency, *amount);
        }
    }

    /// The single currency when uniform, `MIXED` otherwise, `None` when empty.
    pub fn label(&self) -> Option<&str> {
        match self.0.len() {
            0 => None,
            1 => self.0.keys().next().map(String::as_str),
            _ => Some(MIXED_CURRENCY),
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.0.len() > 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(c, v)| (c.as_str(), *v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct DayBucket<'a> {
    pub date: NaiveDate,
    pub records: Vec<&'a CostRecord>,
    pub cost: f64,
    pub quantity: f64,
    pub currencies: CurrencyTotals,
}

#[derive(Debug, Clone)]
pub struct AccountBreakdown<'a> {
    pub account_id: String,
    pub days: Vec<DayBucket<'a>>,
    pub cost: f64,
    pub quantity: f64,
    pub currencies: CurrencyTotals,
}

impl AccountBreakdown<'_> {
    pub fn record_count(&self) -> usize {
        self.days.iter().map(|d| d.records.len()).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostBreakdown<'a> {
    pub accounts: Vec<AccountBreakdown<'a>>,
    pub grand_total: f64,
    pub quantity: f64,
    pub currencies: CurrencyTotals,
}

#[derive(Default)]
struct DayAccumulator<'a> {
    records: Vec<&'a CostRecord>,
    cost: f64,
    quantity: f64,
    currencies: CurrencyTotals,
}

impl<'a> DayAccumulator<'a> {
    fn add(&mut self, record: &'a CostRecord) {
        self.cost += record.cost;
        self.quantity += record.quantity.unwrap_or(0.0);
        self.currencies.add(&record.currency, record.cost);
        self.records.push(record);
    }

    fn finish(self, date: NaiveDate) -> DayBucket<'a> {
        DayBucket {
            date,
            records: self.records,
            cost: self.cost,
            quantity: self.quantity,
            currencies: self.currencies,
        }
    }
}

impl<'a> CostBreakdown<'a> {
    /// Bucket records by account, then by billing day.
    pub fn from_records(records: &'a [CostRecord]) -> Self {
        let mut map: BTreeMap<&str, BTreeMap<NaiveDate, DayAccumulator<'a>>> = BTreeMap::new();

        for record in records {
            map.entry(record.account_id.as_str())
                .or_default()
                .entry(record.billing_day())
                .or_default()
                .add(record);
        }

        let mut breakdown = CostBreakdown::default();
        for (account_id, days) in map {
            let days: Vec<DayBucket<'a>> = days
                .into_iter()
                .map(|(date, acc)| acc.finish(date))
                .collect();

            let mut account = AccountBreakdown {
                account_id: account_id.to_string(),
                days: Vec::new(),
                cost: 0.0,
                quantity: 0.0,
                currencies: CurrencyTotals::default(),
            };
            for day in &days {
                account.cost += day.cost;
                account.quantity += day.quantity;
                account.currencies.merge(&day.currencies);
            }
            account.days = days;

            breakdown.grand_total += account.cost;
            breakdown.quantity += account.quantity;
            breakdown.currencies.merge(&account.currencies);
            breakdown.accounts.push(account);
        }

        if breakdown.currencies.is_mixed() {
            tracing::warn!(
                currencies = ?breakdown.currencies.as_map().keys().collect::<Vec<_>>(),
                "cost data mixes currencies; totals are reported per currency"
            );
        }

        breakdown
    }

    pub fn record_count(&self) -> usize {
        self.accounts.iter().map(AccountBreakdown::record_count).sum()
    }
}
