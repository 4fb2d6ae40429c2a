//! Document-store adapter boundary.
//!
//! The job engine never owns persistence. It talks to an external document
//! collection through the five operations of `DocumentStore`: insert, batched
//! insert, single-document conditional update, filtered/sorted/limited query
//! and batched delete. No operation spans multiple documents atomically
//! except that a conditional update applies to one document or not at all,
//! which is what job claiming relies on.

use std::{cmp::Ordering, future::Future, pin::Pin};

use serde_json::{Map, Value};

use crate::error::Result;

pub mod memory;

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operations the engine requires from the backing document store.
///
/// Implementations must make `conditional_update` atomic per document: the
/// conditions are evaluated and the fields written under one step, so two
/// callers racing on `state == waiting` cannot both observe success.
pub trait DocumentStore: Send + Sync + std::fmt::Debug + 'static {
    /// Inserts a document and returns its id.
    ///
    /// Uses the document's `id` field when present, otherwise the store
    /// assigns one.
    fn insert(&self, collection: &str, document: Document) -> StoreFuture<'_, String>;

    /// Inserts several independent documents and returns their ids in order.
    fn batch_insert(&self, collection: &str, documents: Vec<Document>)
        -> StoreFuture<'_, Vec<String>>;

    /// Writes `fields` into document `id` only if every condition matches.
    ///
    /// Returns `true` when the update was applied and `false` when the
    /// document is missing or a condition did not hold.
    fn conditional_update(
        &self,
        collection: &str,
        id: &str,
        conditions: Vec<Filter>,
        fields: Document,
    ) -> StoreFuture<'_, bool>;

    /// Returns documents matching all filters, sorted by `order_by` and
    /// truncated to `limit`.
    fn query(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<Document>>;

    /// Deletes the given documents and returns how many existed.
    fn batch_delete(&self, collection: &str, ids: Vec<String>) -> StoreFuture<'_, usize>;
}

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals value (a `null` value also matches a missing field).
    Eq,
    /// Field differs from value.
    Ne,
    /// Field is less than value.
    Lt,
    /// Field is less than or equal to value.
    Lte,
    /// Field is greater than value.
    Gt,
    /// Field is greater than or equal to value.
    Gte,
    /// Field equals one element of an array value.
    In,
}

/// A single `field op value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Document field name.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

impl Filter {
    /// Creates a filter.
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self { field: field.into(), op, value: value.into() }
    }

    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Ne, value)
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    /// `field <= value`.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    /// `field >= value`.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    /// `field in values`.
    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: Vec<V>) -> Self {
        let values = values.into_iter().map(Into::into).collect::<Vec<Value>>();
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    /// Evaluates the predicate against a document.
    ///
    /// Range operators never match a missing field or values of different
    /// kinds (number against string, for example).
    pub fn matches(&self, document: &Document) -> bool {
        let field = document.get(&self.field).unwrap_or(&Value::Null);

        match self.op {
            FilterOp::Eq => values_equal(field, &self.value),
            FilterOp::Ne => !values_equal(field, &self.value),
            FilterOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|option| values_equal(field, option)),
                _ => false,
            },
            FilterOp::Lt => compare_values(field, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(field, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Sort direction of an `OrderBy` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Document field name.
    pub field: String,
    /// Sort direction.
    pub direction: SortDirection,
}

impl OrderBy {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Ascending }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Descending }
    }
}

/// Orders two documents by a list of sort keys.
///
/// Missing or incomparable fields sort after present ones regardless of
/// direction.
pub fn compare_documents(a: &Document, b: &Document, order_by: &[OrderBy]) -> Ordering {
    for key in order_by {
        let left = a.get(&key.field).filter(|v| !v.is_null());
        let right = b.get(&key.field).filter(|v| !v.is_null());

        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => {
                let natural = compare_values(l, r).unwrap_or(Ordering::Equal);
                match key.direction {
                    SortDirection::Ascending => natural,
                    SortDirection::Descending => natural.reverse(),
                }
            },
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
