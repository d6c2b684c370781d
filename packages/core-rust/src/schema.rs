//! Collection schema: columns, relations, and the filter operators they
//! support.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolkitError};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

macro_rules! operators {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Filter operator usable in a condition tree leaf.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Operator {
            $(
                #[serde(rename = $name)]
                $variant,
            )*
        }

        impl Operator {
            /// Every operator, in declaration order.
            pub const ALL: &'static [Operator] = &[$(Operator::$variant),*];

            /// Wire name (`"not_equal"`, `"previous_x_days"`, ...).
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Operator::$variant => $name,)*
                }
            }
        }

        impl FromStr for Operator {
            type Err = ToolkitError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Operator::$variant),)*
                    _ => Err(ToolkitError::condition_tree(format!("unknown operator '{s}'"))),
                }
            }
        }
    };
}

operators! {
    Present => "present",
    Blank => "blank",
    Missing => "missing",
    Equal => "equal",
    NotEqual => "not_equal",
    LessThan => "less_than",
    GreaterThan => "greater_than",
    In => "in",
    NotIn => "not_in",
    Like => "like",
    StartsWith => "starts_with",
    EndsWith => "ends_with",
    Contains => "contains",
    Match => "match",
    NotContains => "not_contains",
    LongerThan => "longer_than",
    ShorterThan => "shorter_than",
    Before => "before",
    After => "after",
    AfterXHoursAgo => "after_x_hours_ago",
    BeforeXHoursAgo => "before_x_hours_ago",
    Future => "future",
    Past => "past",
    PreviousMonthToDate => "previous_month_to_date",
    PreviousMonth => "previous_month",
    PreviousQuarterToDate => "previous_quarter_to_date",
    PreviousQuarter => "previous_quarter",
    PreviousWeekToDate => "previous_week_to_date",
    PreviousWeek => "previous_week",
    PreviousXDaysToDate => "previous_x_days_to_date",
    PreviousXDays => "previous_x_days",
    PreviousYearToDate => "previous_year_to_date",
    PreviousYear => "previous_year",
    Today => "today",
    Yesterday => "yesterday",
    IncludesAll => "includes_all",
}

const COMMON_OPERATORS: [Operator; 5] = [
    Operator::Blank,
    Operator::Equal,
    Operator::Missing,
    Operator::NotEqual,
    Operator::Present,
];

const DATE_OPERATORS: [Operator; 16] = [
    Operator::Today,
    Operator::Yesterday,
    Operator::PreviousXDays,
    Operator::PreviousXDaysToDate,
    Operator::PreviousWeek,
    Operator::PreviousWeekToDate,
    Operator::PreviousMonth,
    Operator::PreviousMonthToDate,
    Operator::PreviousQuarter,
    Operator::PreviousQuarterToDate,
    Operator::PreviousYear,
    Operator::PreviousYearToDate,
    Operator::Past,
    Operator::Future,
    Operator::Before,
    Operator::After,
];

impl Operator {
    /// Operator with the opposite meaning, if one exists.
    ///
    /// `not_X` maps to `X` and back, `blank` and `present` swap.
    #[must_use]
    pub fn inverse(self) -> Option<Operator> {
        match self {
            Self::Blank => Some(Self::Present),
            Self::Present => Some(Self::Blank),
            _ => {
                let name = self.as_str();
                match name.strip_prefix("not_") {
                    Some(positive) => positive.parse().ok(),
                    None => format!("not_{name}").parse().ok(),
                }
            }
        }
    }

    /// Operators whose leaf never carries a value.
    #[must_use]
    pub fn is_valueless(self) -> bool {
        matches!(
            self,
            Self::Blank
                | Self::Missing
                | Self::Present
                | Self::Today
                | Self::Yesterday
                | Self::Past
                | Self::Future
                | Self::PreviousWeek
                | Self::PreviousWeekToDate
                | Self::PreviousMonth
                | Self::PreviousMonthToDate
                | Self::PreviousQuarter
                | Self::PreviousQuarterToDate
                | Self::PreviousYear
                | Self::PreviousYearToDate
        )
    }

    /// Operators whose leaf value is a list.
    #[must_use]
    pub fn takes_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::IncludesAll)
    }

    /// Operators whose leaf value is a count (hours, days, length).
    #[must_use]
    pub fn takes_number(self) -> bool {
        matches!(
            self,
            Self::PreviousXDays
                | Self::PreviousXDaysToDate
                | Self::BeforeXHoursAgo
                | Self::AfterXHoursAgo
                | Self::LongerThan
                | Self::ShorterThan
        )
    }

    /// Operators a column of this type may be filtered with at all.
    #[must_use]
    pub fn allowed_for(primitive: PrimitiveType) -> BTreeSet<Operator> {
        let mut operators: BTreeSet<Operator> = COMMON_OPERATORS.into_iter().collect();
        let lists = [Operator::In, Operator::NotIn, Operator::IncludesAll];
        match primitive {
            PrimitiveType::String => {
                operators.extend(lists);
                operators.extend([
                    Operator::Contains,
                    Operator::NotContains,
                    Operator::EndsWith,
                    Operator::StartsWith,
                    Operator::LongerThan,
                    Operator::ShorterThan,
                    Operator::Like,
                    Operator::Match,
                ]);
            }
            PrimitiveType::Number => {
                operators.extend(lists);
                operators.extend([Operator::GreaterThan, Operator::LessThan]);
            }
            PrimitiveType::Dateonly => {
                operators.extend(DATE_OPERATORS);
                operators.extend([Operator::GreaterThan, Operator::LessThan]);
            }
            PrimitiveType::Date => {
                operators.extend(DATE_OPERATORS);
                operators.extend([
                    Operator::BeforeXHoursAgo,
                    Operator::AfterXHoursAgo,
                    Operator::GreaterThan,
                    Operator::LessThan,
                ]);
            }
            PrimitiveType::Time | PrimitiveType::Timeonly => {
                operators.extend([Operator::LessThan, Operator::GreaterThan]);
            }
            PrimitiveType::Enum | PrimitiveType::Binary => operators.extend(lists),
            PrimitiveType::Uuid => {
                operators.extend(lists);
                operators.extend([
                    Operator::Contains,
                    Operator::EndsWith,
                    Operator::StartsWith,
                    Operator::Like,
                ]);
            }
            PrimitiveType::Json => {
                operators = [Operator::Blank, Operator::Missing, Operator::Present]
                    .into_iter()
                    .collect();
            }
            PrimitiveType::Boolean | PrimitiveType::Point => {}
        }
        operators
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Column types
// ---------------------------------------------------------------------------

/// Scalar type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimitiveType {
    Boolean,
    Binary,
    Date,
    Dateonly,
    Enum,
    Json,
    Number,
    Point,
    String,
    Time,
    Timeonly,
    Uuid,
}

/// Type of a column: a primitive, an array of a type, or a fixed object shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnType {
    Primitive(PrimitiveType),
    Array(Box<ColumnType>),
    Object(BTreeMap<String, ColumnType>),
}

impl From<PrimitiveType> for ColumnType {
    fn from(primitive: PrimitiveType) -> Self {
        Self::Primitive(primitive)
    }
}

impl ColumnType {
    #[must_use]
    pub fn as_primitive(&self) -> Option<PrimitiveType> {
        match self {
            Self::Primitive(primitive) => Some(*primitive),
            _ => None,
        }
    }

    /// Operators a backend supports natively for this type unless it says
    /// otherwise.
    #[must_use]
    pub fn default_operators(&self) -> BTreeSet<Operator> {
        let mut operators: BTreeSet<Operator> = COMMON_OPERATORS.into_iter().collect();
        let extra: &[Operator] = match self {
            Self::Array(_) => &[Operator::In, Operator::IncludesAll, Operator::NotIn],
            Self::Object(_) => &[],
            Self::Primitive(primitive) => match primitive {
                PrimitiveType::Boolean | PrimitiveType::Json | PrimitiveType::Point => &[],
                PrimitiveType::Uuid => &[
                    Operator::Contains,
                    Operator::EndsWith,
                    Operator::Like,
                    Operator::StartsWith,
                    Operator::In,
                    Operator::NotIn,
                ],
                PrimitiveType::Number => &[
                    Operator::GreaterThan,
                    Operator::LessThan,
                    Operator::In,
                    Operator::NotIn,
                ],
                PrimitiveType::String => &[
                    Operator::Contains,
                    Operator::EndsWith,
                    Operator::In,
                    Operator::Like,
                    Operator::LongerThan,
                    Operator::NotContains,
                    Operator::NotIn,
                    Operator::ShorterThan,
                    Operator::StartsWith,
                ],
                PrimitiveType::Date
                | PrimitiveType::Dateonly
                | PrimitiveType::Time
                | PrimitiveType::Timeonly => &[Operator::GreaterThan, Operator::LessThan],
                PrimitiveType::Enum | PrimitiveType::Binary => &[Operator::In, Operator::NotIn],
            },
        };
        operators.extend(extra.iter().copied());
        operators
    }

    /// Whether `value` is acceptable for a column of this type. `Null` always is.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Self::Array(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
            Self::Object(_) => value.as_record().is_some(),
            Self::Primitive(primitive) => match primitive {
                PrimitiveType::Boolean => matches!(value, Value::Bool(_)),
                PrimitiveType::Number => value.is_number(),
                PrimitiveType::Date | PrimitiveType::Dateonly => {
                    value.as_datetime().is_some() || value.is_number()
                }
                PrimitiveType::Binary => matches!(value, Value::Bytes(_) | Value::String(_)),
                PrimitiveType::Json => true,
                PrimitiveType::Enum
                | PrimitiveType::Point
                | PrimitiveType::String
                | PrimitiveType::Time
                | PrimitiveType::Timeonly
                | PrimitiveType::Uuid => matches!(value, Value::String(_)),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Declarative validation rule attached to a column (`longer_than 3`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<Value>,
}

impl ValidationRule {
    #[must_use]
    pub fn new(operator: Operator, value: Option<Value>) -> Self {
        Self { operator, value }
    }

    /// Rendering used in validation error messages: `longer_than(3)`.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.value {
            Some(value) => format!("{}({})", self.operator, value.display()),
            None => self.operator.to_string(),
        }
    }
}

/// A stored column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub column_type: ColumnType,
    pub filter_operators: BTreeSet<Operator>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_sortable: bool,
    #[serde(default)]
    pub validations: Vec<ValidationRule>,
}

impl ColumnSchema {
    /// Sortable, writable column with the default operators of its type.
    #[must_use]
    pub fn new(column_type: impl Into<ColumnType>) -> Self {
        let column_type = column_type.into();
        Self {
            filter_operators: column_type.default_operators(),
            column_type,
            default_value: None,
            enum_values: None,
            is_primary_key: false,
            is_read_only: false,
            is_sortable: true,
            validations: Vec::new(),
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    #[must_use]
    pub fn sortable(mut self, is_sortable: bool) -> Self {
        self.is_sortable = is_sortable;
        self
    }

    #[must_use]
    pub fn operators(mut self, operators: impl IntoIterator<Item = Operator>) -> Self {
        self.filter_operators = operators.into_iter().collect();
        self
    }

    #[must_use]
    pub fn enum_values<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn validation(mut self, rule: ValidationRule) -> Self {
        self.validations.push(rule);
        self
    }
}

/// Many records of this collection point at one record of another through
/// `foreign_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToOneSchema {
    pub foreign_collection: String,
    pub foreign_key: String,
    pub foreign_key_target: String,
}

/// Relation resolved through a key stored on the foreign side
/// (`OneToOne` and `OneToMany`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginKeySchema {
    pub foreign_collection: String,
    pub origin_key: String,
    pub origin_key_target: String,
}

/// Relation resolved through a join collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToManySchema {
    pub foreign_collection: String,
    pub through_collection: String,
    pub foreign_key: String,
    pub foreign_key_target: String,
    pub origin_key: String,
    pub origin_key_target: String,
    #[serde(default)]
    pub foreign_relation: Option<String>,
}

/// Many-to-one whose target collection is chosen by a type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicManyToOneSchema {
    pub foreign_collections: Vec<String>,
    pub foreign_key: String,
    pub foreign_key_type_field: String,
    pub foreign_key_targets: BTreeMap<String, String>,
}

/// Reverse side of a polymorphic many-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicOriginSchema {
    pub foreign_collection: String,
    pub origin_key: String,
    pub origin_key_target: String,
    pub origin_type_field: String,
    pub origin_type_value: String,
}

/// A field: a column or one of the relation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldSchema {
    Column(ColumnSchema),
    ManyToOne(ManyToOneSchema),
    OneToOne(OriginKeySchema),
    OneToMany(OriginKeySchema),
    ManyToMany(ManyToManySchema),
    PolymorphicManyToOne(PolymorphicManyToOneSchema),
    PolymorphicOneToOne(PolymorphicOriginSchema),
    PolymorphicOneToMany(PolymorphicOriginSchema),
}

impl FieldSchema {
    #[must_use]
    pub fn as_column(&self) -> Option<&ColumnSchema> {
        match self {
            Self::Column(column) => Some(column),
            _ => None,
        }
    }

    pub fn as_column_mut(&mut self) -> Option<&mut ColumnSchema> {
        match self {
            Self::Column(column) => Some(column),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_column(&self) -> bool {
        matches!(self, Self::Column(_))
    }

    #[must_use]
    pub fn is_relation(&self) -> bool {
        !self.is_column()
    }

    #[must_use]
    pub fn is_polymorphic(&self) -> bool {
        matches!(
            self,
            Self::PolymorphicManyToOne(_) | Self::PolymorphicOneToOne(_) | Self::PolymorphicOneToMany(_)
        )
    }

    /// Relations whose value is a single nested record.
    #[must_use]
    pub fn is_to_one(&self) -> bool {
        matches!(
            self,
            Self::ManyToOne(_) | Self::OneToOne(_) | Self::PolymorphicManyToOne(_) | Self::PolymorphicOneToOne(_)
        )
    }

    /// Target collection of a non-polymorphic relation.
    #[must_use]
    pub fn foreign_collection(&self) -> Option<&str> {
        match self {
            Self::ManyToOne(relation) => Some(&relation.foreign_collection),
            Self::OneToOne(relation) | Self::OneToMany(relation) => Some(&relation.foreign_collection),
            Self::ManyToMany(relation) => Some(&relation.foreign_collection),
            Self::PolymorphicOneToOne(relation) | Self::PolymorphicOneToMany(relation) => {
                Some(&relation.foreign_collection)
            }
            Self::Column(_) | Self::PolymorphicManyToOne(_) => None,
        }
    }

    /// Kind name used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Column(_) => "Column",
            Self::ManyToOne(_) => "ManyToOne",
            Self::OneToOne(_) => "OneToOne",
            Self::OneToMany(_) => "OneToMany",
            Self::ManyToMany(_) => "ManyToMany",
            Self::PolymorphicManyToOne(_) => "PolymorphicManyToOne",
            Self::PolymorphicOneToOne(_) => "PolymorphicOneToOne",
            Self::PolymorphicOneToMany(_) => "PolymorphicOneToMany",
        }
    }
}

impl From<ColumnSchema> for FieldSchema {
    fn from(column: ColumnSchema) -> Self {
        Self::Column(column)
    }
}

// ---------------------------------------------------------------------------
// Collection schema
// ---------------------------------------------------------------------------

/// Exposed schema of a collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    pub actions: BTreeSet<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub countable: bool,
    #[serde(default)]
    pub charts: BTreeSet<String>,
}

impl CollectionSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field: impl Into<FieldSchema>) -> Self {
        self.fields.insert(name.into(), field.into());
        self
    }

    /// Looks up a top-level field.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Schema`] for unknown fields.
    pub fn field(&self, name: &str) -> Result<&FieldSchema> {
        self.fields
            .get(name)
            .ok_or_else(|| ToolkitError::schema(format!("field '{name}' not found")))
    }

    /// Looks up a top-level column.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Schema`] for unknown fields and relations.
    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        let field = self.field(name)?;
        field.as_column().ok_or_else(|| {
            ToolkitError::schema(format!(
                "unexpected field type for '{name}' (found {} expected Column)",
                field.kind()
            ))
        })
    }

    /// Primary key column names, in field order.
    #[must_use]
    pub fn primary_keys(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, field)| field.as_column().is_some_and(|column| column.is_primary_key))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether `name` is a column some relation uses as its foreign key.
    #[must_use]
    pub fn is_foreign_key(&self, name: &str) -> bool {
        if !self.fields.get(name).is_some_and(FieldSchema::is_column) {
            return false;
        }
        self.fields.values().any(|field| match field {
            FieldSchema::ManyToOne(relation) => relation.foreign_key == name,
            FieldSchema::PolymorphicManyToOne(relation) => {
                relation.foreign_key == name || relation.foreign_key_type_field == name
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_names_round_trip() {
        for operator in Operator::ALL {
            assert_eq!(operator.as_str().parse::<Operator>().ok(), Some(*operator));
        }
        assert!("bogus".parse::<Operator>().is_err());
    }

    #[test]
    fn operator_inverse_pairs() {
        assert_eq!(Operator::Equal.inverse(), Some(Operator::NotEqual));
        assert_eq!(Operator::NotIn.inverse(), Some(Operator::In));
        assert_eq!(Operator::Contains.inverse(), Some(Operator::NotContains));
        assert_eq!(Operator::Blank.inverse(), Some(Operator::Present));
        assert_eq!(Operator::LessThan.inverse(), None);
    }

    #[test]
    fn default_operators_follow_column_type() {
        let number = ColumnType::from(PrimitiveType::Number).default_operators();
        assert!(number.contains(&Operator::GreaterThan));
        assert!(!number.contains(&Operator::Like));

        let tags = ColumnType::Array(Box::new(PrimitiveType::String.into())).default_operators();
        assert!(tags.contains(&Operator::IncludesAll));
    }

    #[test]
    fn primary_keys_and_foreign_keys() {
        let schema = CollectionSchema::new()
            .with_field("id", ColumnSchema::new(PrimitiveType::Number).primary_key())
            .with_field("author_id", ColumnSchema::new(PrimitiveType::Number))
            .with_field(
                "author",
                FieldSchema::ManyToOne(ManyToOneSchema {
                    foreign_collection: "persons".into(),
                    foreign_key: "author_id".into(),
                    foreign_key_target: "id".into(),
                }),
            );
        assert_eq!(schema.primary_keys(), vec!["id".to_string()]);
        assert!(schema.is_foreign_key("author_id"));
        assert!(!schema.is_foreign_key("id"));
        assert!(schema.column("author").is_err());
    }

    #[test]
    fn column_type_accepts_values() {
        let date = ColumnType::from(PrimitiveType::Date);
        assert!(date.accepts(&Value::from("2024-01-01")));
        assert!(!date.accepts(&Value::from("yesterday")));
        assert!(ColumnType::from(PrimitiveType::Number).accepts(&Value::Null));
    }
}
