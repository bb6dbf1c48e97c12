//! Schema metadata and table classification.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

lazy_static! {
    static ref MEASURE_COLUMN: Regex = Regex::new(
        r"(?i)(amount|balance|value|sum|total|count|quantity|qty|limit|exposure|principal|interest|price|cost|revenue)"
    )
    .unwrap();
    static ref KEY_COLUMN: Regex = Regex::new(r"(?i)(_id|_key|_code|_no)$").unwrap();
}

const FACT_INDICATORS: &[&str] = &["fact", "detail", "transaction", "event", "log", "activity", "history"];
const DIMENSION_INDICATORS: &[&str] = &[
    "dimension", "dim", "master", "reference", "lookup", "customer", "product", "account", "region",
];
const NUMERIC_TYPES: &[&str] = &[
    "int", "bigint", "smallint", "tinyint", "decimal", "numeric", "float", "real", "money", "smallmoney",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: None,
            is_nullable: true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        let ty = self.data_type.to_lowercase();
        NUMERIC_TYPES.contains(&ty.as_str())
    }

    /// Numeric, non-key column whose name reads like an additive measure.
    pub fn is_measure(&self) -> bool {
        self.is_numeric() && MEASURE_COLUMN.is_match(&self.name) && !self.is_key()
    }

    /// Surrogate or natural key by naming convention (`_ID`, `_KEY`, `_CODE`, `_NO`).
    pub fn is_key(&self) -> bool {
        KEY_COLUMN.is_match(&self.name)
    }

    pub fn is_temporal(&self) -> bool {
        let ty = self.data_type.to_lowercase();
        ty.contains("date") || ty.contains("time") || self.name.to_lowercase().contains("date")
    }

    /// `varchar(100)`, `decimal`, ... as shown in prompts.
    pub fn display_type(&self) -> String {
        match self.max_length {
            Some(-1) => format!("{}(max)", self.data_type),
            Some(len) if len > 0 => format!("{}({})", self.data_type, len),
            _ => self.data_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Fact,
    Dimension,
    Lookup,
    #[default]
    Unknown,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableKind::Fact => "fact",
            TableKind::Dimension => "dimension",
            TableKind::Lookup => "lookup",
            TableKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Star,
    Snowflake,
    Generic,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaType::Star => "star",
            SchemaType::Snowflake => "snowflake",
            SchemaType::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub kind: TableKind,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub sample_data: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn default_schema() -> String {
    "dbo".to_string()
}

impl TableInfo {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            schema: default_schema(),
            name: name.into(),
            kind: TableKind::Unknown,
            columns,
            primary_key: Vec::new(),
            sample_data: Vec::new(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn measure_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_measure())
    }
}

/// Foreign key edge `from_table.from_column -> to_table.to_column`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

impl Relationship {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_column: from_column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
        }
    }

    pub fn involves(&self, table: &str) -> bool {
        self.from_table.eq_ignore_ascii_case(table) || self.to_table.eq_ignore_ascii_case(table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaSummary {
    pub database: String,
    pub total_tables: usize,
    pub fact_tables: Vec<String>,
    pub dimension_tables: Vec<String>,
    pub relationship_count: usize,
    pub schema_type: SchemaType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DatabaseSchema {
    pub database: String,
    pub tables: Vec<TableInfo>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl DatabaseSchema {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            tables: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Case-insensitive lookup by bare or schema-qualified name.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        let name = name.trim_matches(|c| c == '\'' || c == '[' || c == ']');
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name) || t.full_name().eq_ignore_ascii_case(name))
    }

    pub fn tables_of_kind(&self, kind: TableKind) -> impl Iterator<Item = &TableInfo> {
        self.tables.iter().filter(move |t| t.kind == kind)
    }

    pub fn relationships_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships.iter().filter(move |r| r.involves(table))
    }

    fn foreign_key_count(&self, table: &str) -> usize {
        self.relationships
            .iter()
            .filter(|r| r.from_table.eq_ignore_ascii_case(table))
            .count()
    }

    /// Assign a [`TableKind`] to every table from its name, columns and foreign keys.
    pub fn classify_tables(&mut self) {
        let kinds: Vec<TableKind> = self
            .tables
            .iter()
            .map(|t| classify_table(t, self.foreign_key_count(&t.name)))
            .collect();
        for (table, kind) in self.tables.iter_mut().zip(kinds) {
            table.kind = kind;
        }
    }

    pub fn schema_type(&self) -> SchemaType {
        let has_fact = self.tables_of_kind(TableKind::Fact).next().is_some();
        let has_dim = self.tables_of_kind(TableKind::Dimension).next().is_some();
        if !(has_fact && has_dim) {
            return SchemaType::Generic;
        }
        let kind_of = |name: &str| self.table(name).map(|t| t.kind);
        let dim_to_dim = self.relationships.iter().any(|r| {
            kind_of(&r.from_table) == Some(TableKind::Dimension)
                && kind_of(&r.to_table) == Some(TableKind::Dimension)
        });
        if dim_to_dim {
            SchemaType::Snowflake
        } else {
            SchemaType::Star
        }
    }

    pub fn summary(&self) -> SchemaSummary {
        SchemaSummary {
            database: self.database.clone(),
            total_tables: self.tables.len(),
            fact_tables: self.tables_of_kind(TableKind::Fact).map(|t| t.name.clone()).collect(),
            dimension_tables: self
                .tables_of_kind(TableKind::Dimension)
                .map(|t| t.name.clone())
                .collect(),
            relationship_count: self.relationships.len(),
            schema_type: self.schema_type(),
        }
    }

    /// Stable fingerprint of table and column names.
    pub fn schema_hash(&self) -> String {
        let mut entries: Vec<String> = self
            .tables
            .iter()
            .map(|t| {
                let mut cols: Vec<String> = t.columns.iter().map(|c| c.name.to_lowercase()).collect();
                cols.sort();
                format!("{}:{}", t.full_name().to_lowercase(), cols.join(","))
            })
            .collect();
        entries.sort();
        let digest = Sha256::digest(entries.join("|").as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

fn classify_table(table: &TableInfo, foreign_keys: usize) -> TableKind {
    let name = table.name.to_lowercase();
    let mut fact_score = 0;
    let mut dim_score = 0;

    if FACT_INDICATORS.iter().any(|i| name.contains(i)) {
        fact_score += 3;
    }
    if DIMENSION_INDICATORS.iter().any(|i| name.contains(i)) {
        dim_score += 3;
    }

    let measures = table.measure_columns().count();
    if measures > 0 {
        fact_score += 2;
    }
    if table.columns.iter().any(|c| c.is_temporal()) {
        fact_score += 1;
    }
    if foreign_keys >= 2 {
        fact_score += 2;
    } else {
        dim_score += 1;
    }

    if fact_score > dim_score && fact_score >= 2 {
        TableKind::Fact
    } else if dim_score > fact_score && dim_score >= 2 {
        TableKind::Dimension
    } else if foreign_keys == 0 && measures == 0 {
        TableKind::Lookup
    } else if measures > 0 || foreign_keys >= 2 {
        TableKind::Fact
    } else {
        TableKind::Dimension
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Small banking star schema shared by unit tests.
    pub fn banking_schema() -> DatabaseSchema {
        let mut schema = DatabaseSchema::new("banking");
        schema.tables.push(TableInfo::new(
            "DIM_CUSTOMER",
            vec![
                ColumnInfo::new("CUSTOMER_KEY", "int"),
                ColumnInfo::new("CUSTOMER_NAME", "varchar"),
                ColumnInfo::new("SEGMENT", "varchar"),
            ],
        ));
        schema.tables.push(TableInfo::new(
            "FACT_LOAN",
            vec![
                ColumnInfo::new("LOAN_ID", "int"),
                ColumnInfo::new("CUSTOMER_KEY", "int"),
                ColumnInfo::new("DATE_KEY", "int"),
                ColumnInfo::new("PRINCIPAL_AMOUNT_USD", "decimal"),
                ColumnInfo::new("ORIGINATION_DATE", "date"),
            ],
        ));
        schema.tables.push(TableInfo::new(
            "FACT_CREDIT_ARRANGEMENT",
            vec![
                ColumnInfo::new("ARRANGEMENT_ID", "int"),
                ColumnInfo::new("CUSTOMER_KEY", "int"),
                ColumnInfo::new("EXPOSURE_AMOUNT", "decimal"),
            ],
        ));
        schema.tables.push(TableInfo::new(
            "DIM_DATE",
            vec![ColumnInfo::new("DATE_KEY", "int"), ColumnInfo::new("CALENDAR_DATE", "date")],
        ));
        schema.relationships = vec![
            Relationship::new("FACT_LOAN", "CUSTOMER_KEY", "DIM_CUSTOMER", "CUSTOMER_KEY"),
            Relationship::new("FACT_LOAN", "DATE_KEY", "DIM_DATE", "DATE_KEY"),
            Relationship::new("FACT_CREDIT_ARRANGEMENT", "CUSTOMER_KEY", "DIM_CUSTOMER", "CUSTOMER_KEY"),
        ];
        schema.classify_tables();
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::banking_schema;
    use super::*;

    #[test]
    fn test_classification() {
        let schema = banking_schema();
        assert_eq!(schema.table("FACT_LOAN").unwrap().kind, TableKind::Fact);
        assert_eq!(schema.table("fact_credit_arrangement").unwrap().kind, TableKind::Fact);
        assert_eq!(schema.table("DIM_CUSTOMER").unwrap().kind, TableKind::Dimension);
        assert_eq!(schema.table("dbo.DIM_DATE").unwrap().kind, TableKind::Dimension);
        assert_eq!(schema.schema_type(), SchemaType::Star);
    }

    #[test]
    fn test_lookup_without_keys_or_measures() {
        let mut schema = DatabaseSchema::new("x");
        schema.tables.push(TableInfo::new(
            "STATUS",
            vec![ColumnInfo::new("CODE", "char"), ColumnInfo::new("LABEL", "varchar")],
        ));
        schema.classify_tables();
        // one-FK bonus gives dimension a score of 1, below the threshold
        assert_eq!(schema.tables[0].kind, TableKind::Lookup);
        assert_eq!(schema.schema_type(), SchemaType::Generic);
    }

    #[test]
    fn test_snowflake_detection() {
        let mut schema = banking_schema();
        schema.tables.push(TableInfo::new(
            "DIM_REGION",
            vec![ColumnInfo::new("REGION_KEY", "int"), ColumnInfo::new("REGION_NAME", "varchar")],
        ));
        schema
            .relationships
            .push(Relationship::new("DIM_CUSTOMER", "REGION_KEY", "DIM_REGION", "REGION_KEY"));
        schema.classify_tables();
        assert_eq!(schema.schema_type(), SchemaType::Snowflake);
    }

    #[test]
    fn test_measure_detection() {
        assert!(ColumnInfo::new("PRINCIPAL_AMOUNT_USD", "decimal").is_measure());
        assert!(!ColumnInfo::new("ACCOUNT_ID", "int").is_measure());
        assert!(!ColumnInfo::new("AMOUNT_TEXT", "varchar").is_measure());
    }

    #[test]
    fn test_schema_hash_ignores_order() {
        let a = banking_schema();
        let mut b = banking_schema();
        b.tables.reverse();
        assert_eq!(a.schema_hash(), b.schema_hash());
        assert_eq!(a.schema_hash().len(), 16);
    }

    #[test]
    fn test_summary() {
        let summary = banking_schema().summary();
        assert_eq!(summary.total_tables, 4);
        assert_eq!(summary.fact_tables.len(), 2);
        assert_eq!(summary.relationship_count, 3);
    }
}
