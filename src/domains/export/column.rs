use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::AuthContext;
use crate::errors::DomainResult;

use super::record::{stringify, Record};
use super::types::ExportJob;

static EMPTY_OPTIONS: Lazy<Map<String, Value>> = Lazy::new(Map::new);

/// Context computed knobs and override functions are evaluated against.
///
/// Dependencies are explicit: the current record, the export being built,
/// the caller-supplied options and the acting subject. Nothing is injected
/// implicitly.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub record: Option<&'a Record>,
    pub export: Option<&'a ExportJob>,
    pub options: &'a Map<String, Value>,
    pub subject: Option<&'a AuthContext>,
}

impl<'a> EvalContext<'a> {
    pub fn empty() -> EvalContext<'static> {
        EvalContext {
            record: None,
            export: None,
            options: &EMPTY_OPTIONS,
            subject: None,
        }
    }

    pub fn with_options(options: &'a Map<String, Value>) -> Self {
        EvalContext {
            record: None,
            export: None,
            options,
            subject: None,
        }
    }
}

/// A configuration knob that is either a literal or computed on demand.
pub enum ConfigValue<T> {
    Literal(T),
    Computed(Arc<dyn Fn(&EvalContext<'_>) -> T + Send + Sync>),
}

impl<T: Clone> ConfigValue<T> {
    pub fn get(&self, ctx: &EvalContext<'_>) -> T {
        match self {
            ConfigValue::Literal(value) => value.clone(),
            ConfigValue::Computed(f) => f(ctx),
        }
    }
}

impl<T> From<T> for ConfigValue<T> {
    fn from(value: T) -> Self {
        ConfigValue::Literal(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            ConfigValue::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Override producing a column's raw state for the current record.
pub type StateFn = Arc<dyn Fn(&EvalContext<'_>) -> DomainResult<Value> + Send + Sync>;

/// Override replacing a resolved value during formatting.
pub type FormatFn = Arc<dyn Fn(Value, &EvalContext<'_>) -> DomainResult<Value> + Send + Sync>;

/// Scalar aggregate functions that can be projected over a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Exists,
    Avg,
    Sum,
    Min,
    Max,
}

impl AggregateFunction {
    fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Exists => "exists",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// Declarative aggregate over a relation, folded into the query plan so the
/// data source can project it ahead of row processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    pub relationship: String,
    pub column: Option<String>,
}

impl AggregateSpec {
    /// Attribute name the projected scalar lands under on each record.
    pub fn projected_name(&self) -> String {
        match (&self.function, &self.column) {
            (AggregateFunction::Count, _) => format!("{}_count", self.relationship),
            (AggregateFunction::Exists, _) => format!("{}_exists", self.relationship),
            (function, Some(column)) => {
                format!("{}_{}_{}", self.relationship, function.as_str(), column)
            }
            (function, None) => format!("{}_{}", self.relationship, function.as_str()),
        }
    }
}

/// Definition of one output column.
pub struct ExportColumn {
    name: String,
    label: Option<ConfigValue<String>>,
    enabled_by_default: ConfigValue<bool>,
    state_using: Option<StateFn>,
    format_using: Option<FormatFn>,
    default_state: Option<ConfigValue<Value>>,
    separator: Option<ConfigValue<String>>,
    distinct_list: ConfigValue<bool>,
    character_limit: Option<ConfigValue<usize>>,
    character_limit_end: ConfigValue<String>,
    word_limit: Option<ConfigValue<usize>>,
    word_limit_end: ConfigValue<String>,
    prefix: Option<ConfigValue<String>>,
    suffix: Option<ConfigValue<String>>,
    list_as_json: ConfigValue<bool>,
    aggregates: Vec<AggregateSpec>,
}

impl ExportColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            enabled_by_default: ConfigValue::Literal(true),
            state_using: None,
            format_using: None,
            default_state: None,
            separator: None,
            distinct_list: ConfigValue::Literal(false),
            character_limit: None,
            character_limit_end: ConfigValue::Literal("...".to_string()),
            word_limit: None,
            word_limit_end: ConfigValue::Literal("...".to_string()),
            prefix: None,
            suffix: None,
            list_as_json: ConfigValue::Literal(false),
            aggregates: Vec::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(ConfigValue::Literal(label.into()));
        self
    }

    pub fn label_with(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.label = Some(ConfigValue::Computed(Arc::new(f)));
        self
    }

    pub fn enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = ConfigValue::Literal(enabled);
        self
    }

    pub fn enabled_by_default_with(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.enabled_by_default = ConfigValue::Computed(Arc::new(f));
        self
    }

    pub fn state_using(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> DomainResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.state_using = Some(Arc::new(f));
        self
    }

    pub fn format_state_using(
        mut self,
        f: impl Fn(Value, &EvalContext<'_>) -> DomainResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.format_using = Some(Arc::new(f));
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_state = Some(ConfigValue::Literal(value.into()));
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(ConfigValue::Literal(separator.into()));
        self
    }

    pub fn distinct_list(mut self) -> Self {
        self.distinct_list = ConfigValue::Literal(true);
        self
    }

    pub fn list_as_json(mut self) -> Self {
        self.list_as_json = ConfigValue::Literal(true);
        self
    }

    pub fn limit(mut self, characters: usize) -> Self {
        self.character_limit = Some(ConfigValue::Literal(characters));
        self
    }

    pub fn limit_end(mut self, end: impl Into<String>) -> Self {
        self.character_limit_end = ConfigValue::Literal(end.into());
        self
    }

    pub fn words(mut self, words: usize) -> Self {
        self.word_limit = Some(ConfigValue::Literal(words));
        self
    }

    pub fn words_end(mut self, end: impl Into<String>) -> Self {
        self.word_limit_end = ConfigValue::Literal(end.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(ConfigValue::Literal(prefix.into()));
        self
    }

    pub fn prefix_with(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.prefix = Some(ConfigValue::Computed(Arc::new(f)));
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(ConfigValue::Literal(suffix.into()));
        self
    }

    pub fn suffix_with(
        mut self,
        f: impl Fn(&EvalContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.suffix = Some(ConfigValue::Computed(Arc::new(f)));
        self
    }

    pub fn counts(mut self, relationship: impl Into<String>) -> Self {
        self.aggregates.push(AggregateSpec {
            function: AggregateFunction::Count,
            relationship: relationship.into(),
            column: None,
        });
        self
    }

    pub fn exists(mut self, relationship: impl Into<String>) -> Self {
        self.aggregates.push(AggregateSpec {
            function: AggregateFunction::Exists,
            relationship: relationship.into(),
            column: None,
        });
        self
    }

    pub fn avg(mut self, relationship: impl Into<String>, column: impl Into<String>) -> Self {
        self.aggregate(AggregateFunction::Avg, relationship, column)
    }

    pub fn sum(mut self, relationship: impl Into<String>, column: impl Into<String>) -> Self {
        self.aggregate(AggregateFunction::Sum, relationship, column)
    }

    pub fn min(mut self, relationship: impl Into<String>, column: impl Into<String>) -> Self {
        self.aggregate(AggregateFunction::Min, relationship, column)
    }

    pub fn max(mut self, relationship: impl Into<String>, column: impl Into<String>) -> Self {
        self.aggregate(AggregateFunction::Max, relationship, column)
    }

    fn aggregate(
        mut self,
        function: AggregateFunction,
        relationship: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.aggregates.push(AggregateSpec {
            function,
            relationship: relationship.into(),
            column: Some(column.into()),
        });
        self
    }

    // --- Getters ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_label(&self, ctx: &EvalContext<'_>) -> String {
        match &self.label {
            Some(label) => label.get(ctx),
            None => derived_label(&self.name),
        }
    }

    pub fn is_enabled_by_default(&self, ctx: &EvalContext<'_>) -> bool {
        self.enabled_by_default.get(ctx)
    }

    pub fn state_override(&self) -> Option<&StateFn> {
        self.state_using.as_ref()
    }

    pub fn get_default_state(&self, ctx: &EvalContext<'_>) -> Option<Value> {
        self.default_state.as_ref().map(|v| v.get(ctx))
    }

    pub fn get_separator(&self, ctx: &EvalContext<'_>) -> Option<String> {
        self.separator.as_ref().map(|v| v.get(ctx))
    }

    pub fn is_distinct_list(&self, ctx: &EvalContext<'_>) -> bool {
        self.distinct_list.get(ctx)
    }

    pub fn aggregates(&self) -> &[AggregateSpec] {
        &self.aggregates
    }

    // --- Formatting ---

    /// Format a resolved state value into its cell text.
    ///
    /// List values are formatted per element, then serialized as a JSON
    /// array or joined (configured separator, falling back to ", ").
    pub fn format_state(&self, state: Value, ctx: &EvalContext<'_>) -> DomainResult<String> {
        match state {
            Value::Array(items) => {
                let formatted = items
                    .into_iter()
                    .map(|item| self.format_scalar(item, ctx))
                    .collect::<DomainResult<Vec<String>>>()?;
                if self.list_as_json.get(ctx) {
                    serde_json::to_string(&formatted)
                        .map_err(|e| crate::errors::DomainError::Serialization(e.to_string()))
                } else {
                    let glue = self.get_separator(ctx).unwrap_or_else(|| ", ".to_string());
                    Ok(formatted.join(&glue))
                }
            }
            scalar => self.format_scalar(scalar, ctx),
        }
    }

    /// The fixed pipeline: format override replaces the value and skips
    /// truncation; char then word truncation each append their marker only
    /// when they actually truncate; prefix and suffix apply last unless blank.
    fn format_scalar(&self, value: Value, ctx: &EvalContext<'_>) -> DomainResult<String> {
        let mut text = match &self.format_using {
            Some(format) => stringify(&format(value, ctx)?),
            None => {
                let mut text = stringify(&value);
                if let Some(limit) = &self.character_limit {
                    text = truncate_chars(&text, limit.get(ctx), &self.character_limit_end.get(ctx));
                }
                if let Some(limit) = &self.word_limit {
                    text = truncate_words(&text, limit.get(ctx), &self.word_limit_end.get(ctx));
                }
                text
            }
        };

        if let Some(prefix) = &self.prefix {
            let prefix = prefix.get(ctx);
            if !prefix.trim().is_empty() {
                text = format!("{}{}", prefix, text);
            }
        }
        if let Some(suffix) = &self.suffix {
            let suffix = suffix.get(ctx);
            if !suffix.trim().is_empty() {
                text = format!("{}{}", text, suffix);
            }
        }

        Ok(text)
    }
}

fn truncate_chars(text: &str, limit: usize, end: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{}{}", truncated.trim_end(), end)
}

fn truncate_words(text: &str, limit: usize, end: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= limit {
        return text.to_string();
    }
    format!("{}{}", words[..limit].join(" "), end)
}

/// Default label: the segment naming what the column reads (the last
/// relationship hop, or the bare attribute), humanized.
fn derived_label(name: &str) -> String {
    let base = match name.rfind('.') {
        Some(last_dot) => {
            let head = &name[..last_dot];
            match head.rfind('.') {
                Some(prev_dot) => &head[prev_dot + 1..],
                None => head,
            }
        }
        None => name,
    };
    humanize(base)
}

fn humanize(name: &str) -> String {
    let mut out = String::new();
    for (i, ch) in name.chars().enumerate() {
        if ch == '_' || ch == '-' {
            out.push(' ');
        } else if ch.is_uppercase() && i > 0 {
            out.push(' ');
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    let mut chars = out.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => out,
    }
}
