//! Test marks and their validators
//!
//! A [`Mark`] is a named annotation attached to a test item with positional
//! and keyword arguments, as a test collector would report it. The validators
//! in this module turn the raw marks isodb understands into typed values:
//!
//! - `django_db` → [`DjangoDbMark`] (keyword-only arguments)
//! - `urls` → the URL configuration name

use crate::error::{IsoError, IsoResult};
use crate::request::{DatabaseSelection, ALL_DATABASES};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the database isolation mark
pub const DJANGO_DB: &str = "django_db";

/// Name of the URL configuration mark
pub const URLS: &str = "urls";

/// Argument value carried by a mark
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkValue {
    /// Explicit "no value"
    None,
    /// Boolean flag
    Bool(bool),
    /// Single string
    Str(String),
    /// List of strings
    List(Vec<String>),
}

impl MarkValue {
    fn describe(&self) -> &'static str {
        match self {
            MarkValue::None => "None",
            MarkValue::Bool(_) => "bool",
            MarkValue::Str(_) => "str",
            MarkValue::List(_) => "list",
        }
    }
}

impl From<bool> for MarkValue {
    fn from(b: bool) -> Self {
        MarkValue::Bool(b)
    }
}

impl From<&str> for MarkValue {
    fn from(s: &str) -> Self {
        MarkValue::Str(s.to_string())
    }
}

impl From<String> for MarkValue {
    fn from(s: String) -> Self {
        MarkValue::Str(s)
    }
}

impl From<Vec<String>> for MarkValue {
    fn from(items: Vec<String>) -> Self {
        MarkValue::List(items)
    }
}

impl From<Vec<&str>> for MarkValue {
    fn from(items: Vec<&str>) -> Self {
        MarkValue::List(items.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for MarkValue {
    fn from(items: [&str; N]) -> Self {
        MarkValue::List(items.iter().map(|s| s.to_string()).collect())
    }
}

/// A raw mark as reported by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    name: String,
    args: Vec<MarkValue>,
    kwargs: BTreeMap<String, MarkValue>,
}

impl Mark {
    /// Create a mark without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Add a positional argument
    pub fn arg(mut self, value: impl Into<MarkValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a keyword argument
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<MarkValue>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Mark name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Positional arguments
    pub fn args(&self) -> &[MarkValue] {
        &self.args
    }

    /// Keyword arguments
    pub fn kwargs(&self) -> &BTreeMap<String, MarkValue> {
        &self.kwargs
    }
}

// ============================================================================
// django_db
// ============================================================================

/// Validated arguments of the `django_db` mark
///
/// Doubles as a builder for the raw mark:
///
/// ```
/// use isodb_core::mark::{DjangoDbMark, Mark};
/// let mark: Mark = DjangoDbMark::new().transaction(true).into();
/// assert_eq!(DjangoDbMark::validate(&mark).unwrap().transaction, true);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DjangoDbMark {
    /// Run the test without an outer transaction (flush afterwards)
    pub transaction: bool,
    /// Reset auto-increment counters before the test
    pub reset_sequences: bool,
    /// Databases the test may touch (`None` = `default` only)
    pub databases: Option<DatabaseSelection>,
    /// Replay the serialized initial data before the test
    pub serialized_rollback: bool,
    /// Restrict flushing to these app labels
    pub available_apps: Option<Vec<String>>,
}

impl DjangoDbMark {
    /// Empty mark (all defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `transaction`
    pub fn transaction(mut self, value: bool) -> Self {
        self.transaction = value;
        self
    }

    /// Set `reset_sequences`
    pub fn reset_sequences(mut self, value: bool) -> Self {
        self.reset_sequences = value;
        self
    }

    /// Set `databases`
    pub fn databases(mut self, value: DatabaseSelection) -> Self {
        self.databases = Some(value);
        self
    }

    /// Set `serialized_rollback`
    pub fn serialized_rollback(mut self, value: bool) -> Self {
        self.serialized_rollback = value;
        self
    }

    /// Set `available_apps`
    pub fn available_apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_apps = Some(apps.into_iter().map(Into::into).collect());
        self
    }

    /// Validate a raw `django_db` mark
    ///
    /// # Errors
    ///
    /// Returns a configuration error for positional arguments, unknown
    /// keywords, or values of the wrong type.
    pub fn validate(mark: &Mark) -> IsoResult<Self> {
        if mark.name() != DJANGO_DB {
            return Err(IsoError::configuration(format!(
                "expected a '{}' mark, got '{}'",
                DJANGO_DB,
                mark.name()
            )));
        }
        if !mark.args().is_empty() {
            return Err(IsoError::configuration(format!(
                "the '{}' mark takes keyword arguments only, got {} positional argument(s)",
                DJANGO_DB,
                mark.args().len()
            )));
        }

        let mut parsed = DjangoDbMark::default();
        for (key, value) in mark.kwargs() {
            match key.as_str() {
                "transaction" => parsed.transaction = expect_bool(key, value)?,
                "reset_sequences" => parsed.reset_sequences = expect_bool(key, value)?,
                "serialized_rollback" => parsed.serialized_rollback = expect_bool(key, value)?,
                "databases" => {
                    parsed.databases = match value {
                        MarkValue::None => None,
                        MarkValue::Str(s) if s == ALL_DATABASES => Some(DatabaseSelection::All),
                        MarkValue::List(items) => Some(DatabaseSelection::Aliases(
                            items.iter().cloned().collect::<BTreeSet<_>>(),
                        )),
                        other => return Err(wrong_type(key, "a list of aliases or \"__all__\"", other)),
                    }
                }
                "available_apps" => {
                    parsed.available_apps = match value {
                        MarkValue::None => None,
                        MarkValue::List(items) => Some(items.clone()),
                        other => return Err(wrong_type(key, "a list of app labels", other)),
                    }
                }
                unknown => {
                    return Err(IsoError::configuration(format!(
                        "the '{}' mark got an unexpected keyword argument '{}'",
                        DJANGO_DB, unknown
                    )))
                }
            }
        }
        Ok(parsed)
    }
}

impl From<DjangoDbMark> for Mark {
    fn from(m: DjangoDbMark) -> Self {
        let mut mark = Mark::new(DJANGO_DB);
        if m.transaction {
            mark = mark.kwarg("transaction", true);
        }
        if m.reset_sequences {
            mark = mark.kwarg("reset_sequences", true);
        }
        if m.serialized_rollback {
            mark = mark.kwarg("serialized_rollback", true);
        }
        match m.databases {
            Some(DatabaseSelection::All) => mark = mark.kwarg("databases", ALL_DATABASES),
            Some(DatabaseSelection::Aliases(aliases)) => {
                mark = mark.kwarg("databases", aliases.into_iter().collect::<Vec<_>>())
            }
            None => {}
        }
        if let Some(apps) = m.available_apps {
            mark = mark.kwarg("available_apps", apps);
        }
        mark
    }
}

fn expect_bool(key: &str, value: &MarkValue) -> IsoResult<bool> {
    match value {
        MarkValue::Bool(b) => Ok(*b),
        other => Err(wrong_type(key, "a bool", other)),
    }
}

fn wrong_type(key: &str, expected: &str, got: &MarkValue) -> IsoError {
    IsoError::configuration(format!(
        "the '{}' mark argument '{}' must be {}, got {}",
        DJANGO_DB,
        key,
        expected,
        got.describe()
    ))
}

// ============================================================================
// urls
// ============================================================================

/// Validate a `urls` mark, returning the URL configuration name
///
/// Accepts exactly one string, positional or as `urls=`.
pub fn validate_urls(mark: &Mark) -> IsoResult<String> {
    let value = match (mark.args(), mark.kwargs().get("urls")) {
        ([single], None) if mark.kwargs().is_empty() => single,
        ([], Some(value)) if mark.kwargs().len() == 1 => value,
        _ => {
            return Err(IsoError::configuration(format!(
                "the '{}' mark takes exactly one argument",
                URLS
            )))
        }
    };
    match value {
        MarkValue::Str(s) => Ok(s.clone()),
        other => Err(IsoError::configuration(format!(
            "the '{}' mark argument must be a str, got {}",
            URLS,
            other.describe()
        ))),
    }
}
