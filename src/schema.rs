use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    analyzer,
    error::{Error, Result},
};

/// Field names of the default documentation schema.
pub mod fields {
    pub const URL: &str = "url";
    pub const TITLE: &str = "title";
    pub const HEADINGS_H1: &str = "headings_h1";
    pub const HEADINGS_H2: &str = "headings_h2";
    pub const HEADINGS_H3: &str = "headings_h3";
    pub const BODY: &str = "body";
    pub const EXCERPT: &str = "excerpt";
    pub const TAGS: &str = "tags";
    pub const PATH: &str = "path";
    pub const LANGUAGE: &str = "language";
    pub const TIMESTAMP: &str = "timestamp";
    /// Ingest-only alias carrying all headings; split into the tiered
    /// heading fields by the writer.
    pub const HEADINGS: &str = "headings";
}

/// The kind of value a field holds and how it is analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text run through the named analyzer.
    Text { analyzer: String },
    /// Exact-match values, one token per value.
    Keyword,
    /// Numbers; indexed (if at all) as exact tokens.
    Numeric,
    /// Retrievable verbatim, never searchable.
    Stored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub stored: bool,
    pub indexed: bool,
    pub boost: f64,
}

impl FieldDef {
    pub fn text(name: &str, analyzer: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text {
                analyzer: analyzer.to_string(),
            },
            stored: false,
            indexed: true,
            boost: 1.0,
        }
    }

    pub fn keyword(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Keyword,
            stored: true,
            indexed: true,
            boost: 1.0,
        }
    }

    pub fn numeric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Numeric,
            stored: true,
            indexed: false,
            boost: 1.0,
        }
    }

    pub fn stored(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Stored,
            stored: true,
            indexed: false,
            boost: 1.0,
        }
    }

    pub fn with_boost(mut self, boost: f64) -> Self {
        self.boost = boost;
        self
    }

    pub fn with_stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    pub fn with_indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    /// The analyzer used to index this field, if it is searchable.
    pub fn analyzer_name(&self) -> Option<&str> {
        if !self.indexed {
            return None;
        }
        match &self.kind {
            FieldKind::Text { analyzer } => Some(analyzer),
            FieldKind::Keyword | FieldKind::Numeric => Some(analyzer::KEYWORD),
            FieldKind::Stored => None,
        }
    }

    pub fn is_searchable(&self) -> bool {
        self.analyzer_name().is_some()
    }
}

/// An immutable, validated set of fields with one identity field.
///
/// # Examples
///
/// ```
/// use segdex::schema::{FieldDef, Schema};
///
/// let schema = Schema::from_definition(
///     vec![FieldDef::keyword("id"), FieldDef::text("body", "standard")],
///     "id",
/// )
/// .unwrap();
/// assert_eq!(schema.unique_field().name, "id");
///
/// // The identity field has to exist.
/// let fields = vec![FieldDef::keyword("id")];
/// assert!(Schema::from_definition(fields, "url").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SchemaDefinition", into = "SchemaDefinition")]
pub struct Schema {
    fields: Vec<FieldDef>,
    unique_field: String,
}

#[derive(Serialize, Deserialize)]
struct SchemaDefinition {
    fields: Vec<FieldDef>,
    unique_field: String,
}

impl TryFrom<SchemaDefinition> for Schema {
    type Error = Error;

    fn try_from(def: SchemaDefinition) -> Result<Self> {
        Schema::from_definition(def.fields, &def.unique_field)
    }
}

impl From<Schema> for SchemaDefinition {
    fn from(schema: Schema) -> Self {
        Self {
            fields: schema.fields,
            unique_field: schema.unique_field,
        }
    }
}

impl Schema {
    /// Validate and build a schema.
    ///
    /// Fails with [`Error::Configuration`] when the unique field is missing
    /// or not a keyword field, a field name repeats, a boost is not a
    /// positive finite number, a text field names an unknown analyzer, or a
    /// stored-only field is marked indexed.
    pub fn from_definition(
        fields: Vec<FieldDef>,
        unique_field: &str,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.is_empty() {
                return Err(Error::Configuration(
                    "field names must not be empty".into(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
            if !(field.boost.is_finite() && field.boost > 0.0) {
                return Err(Error::Configuration(format!(
                    "field '{}' has non-positive boost {}",
                    field.name, field.boost
                )));
            }
            match &field.kind {
                FieldKind::Text { analyzer } => {
                    if !analyzer::is_registered(analyzer) {
                        return Err(Error::Configuration(format!(
                            "field '{}' uses unknown analyzer '{analyzer}'",
                            field.name
                        )));
                    }
                }
                FieldKind::Stored if field.indexed => {
                    return Err(Error::Configuration(format!(
                        "stored-only field '{}' cannot be indexed",
                        field.name
                    )));
                }
                _ => {}
            }
        }

        let unique = fields
            .iter()
            .find(|f| f.name == unique_field)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unique field '{unique_field}' is not declared"
                ))
            })?;
        if unique.kind != FieldKind::Keyword {
            return Err(Error::Configuration(format!(
                "unique field '{unique_field}' must be a keyword field"
            )));
        }

        Ok(Self {
            fields,
            unique_field: unique_field.to_string(),
        })
    }

    /// The schema used for documentation collections.
    pub fn documentation() -> Self {
        use self::fields::*;

        let definition = vec![
            FieldDef::keyword(URL),
            FieldDef::text(TITLE, analyzer::STANDARD)
                .with_boost(3.0)
                .with_stored(true),
            FieldDef::text(HEADINGS_H1, analyzer::STANDARD).with_boost(2.5),
            FieldDef::text(HEADINGS_H2, analyzer::STANDARD).with_boost(2.0),
            FieldDef::text(HEADINGS_H3, analyzer::STANDARD).with_boost(1.5),
            FieldDef::text(BODY, analyzer::STANDARD).with_stored(true),
            FieldDef::stored(EXCERPT),
            FieldDef::keyword(TAGS).with_boost(1.5),
            FieldDef::text(PATH, analyzer::CODE)
                .with_boost(1.2)
                .with_stored(true),
            FieldDef::keyword(LANGUAGE).with_indexed(false),
            FieldDef::numeric(TIMESTAMP),
        ];

        // The definition above is static and known to be valid.
        Self {
            fields: definition,
            unique_field: URL.to_string(),
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn unique_field(&self) -> &FieldDef {
        self.field(&self.unique_field)
            .unwrap_or_else(|| unreachable!("validated at construction"))
    }

    /// Fields that produce postings, in declaration order.
    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_searchable())
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.stored)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_err(result: Result<Schema>) -> String {
        match result {
            Err(Error::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn documentation_schema_is_valid() {
        let schema = Schema::documentation();
        let rebuilt = Schema::from_definition(
            schema.fields().to_vec(),
            fields::URL,
        )
        .unwrap();
        assert_eq!(schema, rebuilt);
        assert_eq!(schema.unique_field().name, fields::URL);
    }

    #[test]
    fn missing_unique_field_fails() {
        let msg = config_err(Schema::from_definition(
            vec![FieldDef::text("body", analyzer::STANDARD)],
            "url",
        ));
        assert!(msg.contains("url"));
    }

    #[test]
    fn duplicate_names_fail() {
        let msg = config_err(Schema::from_definition(
            vec![
                FieldDef::keyword("url"),
                FieldDef::text("body", analyzer::STANDARD),
                FieldDef::text("body", analyzer::CODE),
            ],
            "url",
        ));
        assert!(msg.contains("duplicate"));
    }

    #[test]
    fn names_are_case_sensitive() {
        let schema = Schema::from_definition(
            vec![
                FieldDef::keyword("url"),
                FieldDef::text("Body", analyzer::STANDARD),
                FieldDef::text("body", analyzer::STANDARD),
            ],
            "url",
        )
        .unwrap();
        assert!(schema.has_field("Body"));
        assert!(schema.has_field("body"));
    }

    #[test]
    fn non_positive_boost_fails() {
        for boost in [0.0, -1.0, f64::NAN] {
            config_err(Schema::from_definition(
                vec![
                    FieldDef::keyword("url"),
                    FieldDef::text("body", analyzer::STANDARD)
                        .with_boost(boost),
                ],
                "url",
            ));
        }
    }

    #[test]
    fn unknown_analyzer_fails() {
        let msg = config_err(Schema::from_definition(
            vec![FieldDef::keyword("url"), FieldDef::text("body", "klingon")],
            "url",
        ));
        assert!(msg.contains("klingon"));
    }

    #[test]
    fn indexed_stored_only_field_fails() {
        config_err(Schema::from_definition(
            vec![
                FieldDef::keyword("url"),
                FieldDef::stored("excerpt").with_indexed(true),
            ],
            "url",
        ));
    }

    #[test]
    fn json_roundtrip_revalidates() {
        let schema = Schema::documentation();
        let json = schema.to_json().unwrap();
        assert_eq!(Schema::from_json(&json).unwrap(), schema);

        let broken = json.replace(
            "\"unique_field\":\"url\"",
            "\"unique_field\":\"nope\"",
        );
        assert!(Schema::from_json(&broken).is_err());
    }

    #[test]
    fn searchable_fields_skip_stored_only() {
        let schema = Schema::documentation();
        let names: Vec<_> =
            schema.searchable_fields().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&fields::BODY));
        assert!(!names.contains(&fields::EXCERPT));
        assert!(!names.contains(&fields::TIMESTAMP));
    }
}
