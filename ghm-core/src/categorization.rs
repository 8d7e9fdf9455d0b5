//! Categorization tables
//!
//! Two immutable lookups built once at startup and shared read-only by every
//! event processor:
//! - [`ErrorMappingTable`]: raw error code → (error name, recommended action)
//! - [`SeverityClassMap`]: error name or health-watch group → severity class
//!
//! Loading is strict (any problem is a [`ConfigError`]); lookups never fail.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::ConfigError;

/// Name reported for codes missing from the mapping table
pub const UNKNOWN_ERROR_NAME: &str = "UNKNOWN";

/// Recommended action reported for codes missing from the mapping table
pub const UNKNOWN_RECOMMENDED_ACTION: &str = "UNKNOWN";

/// Name and recommended action for a raw error code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorizationEntry {
    pub error_name: String,
    pub recommended_action: String,
}

impl CategorizationEntry {
    fn unknown() -> Self {
        Self {
            error_name: UNKNOWN_ERROR_NAME.to_string(),
            recommended_action: UNKNOWN_RECOMMENDED_ACTION.to_string(),
        }
    }
}

/// Error code → categorization entry, loaded from a delimited text file.
///
/// Row format: `raw_code,recommended_action[,name]`. Blank lines and lines
/// starting with `#` are skipped, fields are trimmed and may be wrapped in
/// double quotes. Without a name column the code doubles as the name.
/// Duplicate codes are rejected.
#[derive(Debug, Clone)]
pub struct ErrorMappingTable {
    entries: HashMap<String, CategorizationEntry>,
    unknown: CategorizationEntry,
}

impl ErrorMappingTable {
    /// Load the table from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&content, path)?;
        info!(path = ?path, entries = table.len(), "Loaded error mapping table");
        Ok(table)
    }

    /// Parse table content; `origin` is only used in error messages
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        let mut defined_on: HashMap<String, usize> = HashMap::new();

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = |reason: &str| ConfigError::MalformedTable {
                path: origin.to_path_buf(),
                line: line_no,
                reason: reason.to_string(),
            };
            let fields = split_row(line).map_err(malformed)?;
            if fields.len() > 3 {
                return Err(malformed("too many fields, quote values that contain commas"));
            }

            let code = fields[0].as_str();
            if code.is_empty() {
                return Err(malformed("empty error code"));
            }
            let action = match fields.get(1) {
                Some(action) if !action.is_empty() => action.as_str(),
                _ => return Err(malformed("missing recommended action")),
            };
            let name = match fields.get(2) {
                Some(name) if !name.is_empty() => name.as_str(),
                _ => code,
            };

            if let Some(first_line) = defined_on.get(code) {
                return Err(ConfigError::DuplicateCode {
                    path: origin.to_path_buf(),
                    line: line_no,
                    first_line: *first_line,
                    code: code.to_string(),
                });
            }
            defined_on.insert(code.to_string(), line_no);

            debug!(code = code, name = name, action = action, "Error mapping entry");
            entries.insert(
                code.to_string(),
                CategorizationEntry {
                    error_name: name.to_string(),
                    recommended_action: action.to_string(),
                },
            );
        }

        if entries.is_empty() {
            return Err(ConfigError::EmptyTable(origin.to_path_buf()));
        }

        Ok(Self {
            entries,
            unknown: CategorizationEntry::unknown(),
        })
    }

    /// Look up a code, falling back to the `UNKNOWN` sentinel
    pub fn resolve(&self, code: &str) -> (&CategorizationEntry, bool) {
        match self.entries.get(code) {
            Some(entry) => (entry, true),
            None => (&self.unknown, false),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a row on commas outside double quotes; `""` inside quotes is a literal quote
fn split_row(line: &str) -> Result<Vec<String>, &'static str> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote");
    }
    fields.push(field);

    Ok(fields.into_iter().map(|f| f.trim().to_string()).collect())
}

/// Error name or group → severity class, with a default for everything else
#[derive(Debug, Clone)]
pub struct SeverityClassMap {
    classes: HashMap<String, String>,
    default_class: String,
}

impl SeverityClassMap {
    pub fn new(
        classes: HashMap<String, String>,
        default_class: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let default_class = default_class.into();
        if default_class.trim().is_empty() {
            return Err(ConfigError::invalid(
                "categorization.default_class",
                "must not be empty",
            ));
        }
        Ok(Self {
            classes,
            default_class,
        })
    }

    /// Exact match on the error name, then the group, then the default class
    pub fn classify(&self, error_name: &str, group: &str) -> &str {
        self.classes
            .get(error_name)
            .or_else(|| self.classes.get(group))
            .map(String::as_str)
            .unwrap_or(self.default_class.as_str())
    }

    pub fn default_class(&self) -> &str {
        &self.default_class
    }
}

/// Resolved categorization for one condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category<'a> {
    pub error_name: &'a str,
    pub recommended_action: &'a str,
    pub severity_class: &'a str,
    /// False when the code fell back to the `UNKNOWN` sentinel
    pub known: bool,
}

/// Both lookup tables, built once and shared behind an `Arc`
#[derive(Debug)]
pub struct CategorizationTables {
    errors: ErrorMappingTable,
    severity: SeverityClassMap,
}

impl CategorizationTables {
    pub fn new(errors: ErrorMappingTable, severity: SeverityClassMap) -> Self {
        Self { errors, severity }
    }

    /// Load both tables; any failure is fatal to startup
    pub fn load(
        error_mapping_file: &Path,
        severity_classes: HashMap<String, String>,
        default_class: &str,
    ) -> Result<Arc<Self>, ConfigError> {
        let errors = ErrorMappingTable::from_file(error_mapping_file)?;
        let severity = SeverityClassMap::new(severity_classes, default_class)?;
        Ok(Arc::new(Self::new(errors, severity)))
    }

    /// Categorize a raw code raised by a health-watch group
    pub fn categorize(&self, error_code: &str, group: &str) -> Category<'_> {
        let (entry, known) = self.errors.resolve(error_code);
        Category {
            error_name: &entry.error_name,
            recommended_action: &entry.recommended_action,
            severity_class: self.severity.classify(&entry.error_name, group),
            known,
        }
    }

    pub fn errors(&self) -> &ErrorMappingTable {
        &self.errors
    }

    pub fn severity(&self) -> &SeverityClassMap {
        &self.severity
    }
}
