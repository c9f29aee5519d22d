//! Target templates: per-name fetch policy and extraction plan

use crate::rule::entry::Entry;
use crate::rule::parser::{get_i64, get_str, object};
use crate::rule::pipeline::Pipeline;
use crate::rule::timing::parse_duration;
use crate::RuleError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(60);

/// File extensions fetched and stored as binary payloads
pub const FILE_EXTENSIONS: &[&str] = &["webp", "jpg", "jpeg", "png", "bmp", "gif", "ico", "pdf"];

/// Content family of a fetched document, selecting the analyzer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Html,
    Xml,
    Json,
    /// Raw file payload with its extension (without the leading dot)
    Binary(String),
}

impl ContentKind {
    /// Parses a content type name (`html`, `xml`, `json` or a file extension)
    pub fn parse(value: &str) -> Result<Self, RuleError> {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "html" => Ok(ContentKind::Html),
            "xml" => Ok(ContentKind::Xml),
            "json" => Ok(ContentKind::Json),
            ext if is_file_extension(ext) => Ok(ContentKind::Binary(ext.to_string())),
            _ => Err(RuleError::UnknownContentType(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::Html => "html",
            ContentKind::Xml => "xml",
            ContentKind::Json => "json",
            ContentKind::Binary(ext) => ext,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `ext` names a recognized file type
pub fn is_file_extension(ext: &str) -> bool {
    FILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// How targets of a template are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Direct,
    Browser,
}

impl ClientKind {
    fn parse(value: &str) -> Result<Self, RuleError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "direct" | "http" => Ok(ClientKind::Direct),
            "browser" => Ok(ClientKind::Browser),
            _ => Err(RuleError::InvalidDirective {
                directive: "$client".to_string(),
                message: format!("unknown client '{}'", value),
            }),
        }
    }
}

/// Which user agent targets of a template present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentMode {
    /// The job's own agent, picked once per job, sent with the job's cookies
    #[default]
    Job,
    /// A fresh agent from the pool for every request, without cookies
    Random,
}

impl AgentMode {
    fn parse(value: &str) -> Result<Self, RuleError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(AgentMode::Job),
            "random" => Ok(AgentMode::Random),
            _ => Err(RuleError::InvalidDirective {
                directive: "$agents".to_string(),
                message: format!("unknown agent mode '{}'", value),
            }),
        }
    }
}

/// Extraction producing one record per document
#[derive(Debug, Clone, Default)]
pub struct ObjectOutput {
    pub name: String,
    pub data: BTreeMap<String, Pipeline>,
    pub id: Option<Pipeline>,
}

/// Extraction producing one record per node matched by `each`
#[derive(Debug, Clone)]
pub struct ListOutput {
    pub name: String,
    pub each: String,
    pub data: BTreeMap<String, Pipeline>,
    pub id: Option<Pipeline>,
}

/// Static policy and extraction plan for targets created under one name
#[derive(Debug, Clone)]
pub struct TargetTemplate {
    pub name: String,
    pub age: Duration,
    pub priority: u32,
    /// Per-fetch timeout; the fetcher default applies when absent
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub retry_wait: Duration,
    pub mtag: Option<Pipeline>,
    pub client: ClientKind,
    pub agents: AgentMode,
    /// Selector to child entry, in rule order
    pub dive: Vec<(String, Entry)>,
    pub object_outputs: Vec<ObjectOutput>,
    pub list_outputs: Vec<ListOutput>,
}

impl TargetTemplate {
    /// An empty template, used for file targets spawned from data fields
    pub fn file(output_name: &str) -> Self {
        TargetTemplate {
            name: output_name.to_string(),
            age: DEFAULT_AGE,
            priority: 0,
            timeout: None,
            retry: DEFAULT_RETRY,
            retry_wait: DEFAULT_RETRY_WAIT,
            mtag: None,
            client: ClientKind::Direct,
            agents: AgentMode::Job,
            dive: Vec::new(),
            object_outputs: vec![ObjectOutput {
                name: output_name.to_string(),
                ..ObjectOutput::default()
            }],
            list_outputs: Vec::new(),
        }
    }

    /// Builds a template from its JSON object
    ///
    /// # Arguments
    ///
    /// * `name` - The template name (its key in the rule document)
    /// * `value` - The template body
    pub fn from_json(name: &str, value: &Value) -> Result<Self, RuleError> {
        let map = object(value, name)?;

        let duration = |key: &str| -> Result<Option<Duration>, RuleError> {
            get_str(map, key)?
                .map(|s| parse_duration(key, s))
                .transpose()
        };

        let priority = match get_i64(map, "$priority")? {
            Some(p) if p < 0 => {
                return Err(RuleError::InvalidDirective {
                    directive: "$priority".to_string(),
                    message: format!("must be >= 0, got {}", p),
                })
            }
            Some(p) => u32::try_from(p).unwrap_or(u32::MAX),
            None => 0,
        };

        // A negative retry count disables retries
        let retry = match get_i64(map, "$retry")? {
            Some(r) if r < 0 => 0,
            Some(r) => u32::try_from(r).unwrap_or(u32::MAX),
            None => DEFAULT_RETRY,
        };

        let mut dive = Vec::new();
        if let Some(dive_value) = map.get("$dive") {
            for (selector, entry) in object(dive_value, "$dive")? {
                dive.push((selector.clone(), Entry::from_json(entry)?));
            }
        }

        let mut object_outputs = Vec::new();
        let mut list_outputs = Vec::new();
        if let Some(outputs) = map.get("$outputs") {
            let outputs = outputs.as_array().ok_or_else(|| RuleError::InvalidDirective {
                directive: "$outputs".to_string(),
                message: "expected an array".to_string(),
            })?;

            for output in outputs {
                match parse_output(output)? {
                    Output::Object(o) => object_outputs.push(o),
                    Output::List(l) => list_outputs.push(l),
                }
            }
        }

        Ok(TargetTemplate {
            name: name.to_string(),
            age: duration("$age")?.unwrap_or(DEFAULT_AGE),
            priority,
            timeout: duration("$timeout")?,
            retry,
            retry_wait: duration("$retryWait")?.unwrap_or(DEFAULT_RETRY_WAIT),
            mtag: Pipeline::parse_optional(get_str(map, "$mtag")?)?,
            client: ClientKind::parse(get_str(map, "$client")?.unwrap_or_default())?,
            agents: AgentMode::parse(get_str(map, "$agents")?.unwrap_or_default())?,
            dive,
            object_outputs,
            list_outputs,
        })
    }
}

enum Output {
    Object(ObjectOutput),
    List(ListOutput),
}

fn parse_output(value: &Value) -> Result<Output, RuleError> {
    let map = object(value, "$outputs")?;

    let name = get_str(map, "$name")?
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RuleError::InvalidDirective {
            directive: "$outputs".to_string(),
            message: "output is missing $name".to_string(),
        })?
        .to_string();

    let mut data = BTreeMap::new();
    if let Some(data_value) = map.get("$data") {
        for (key, expr) in object(data_value, "$data")? {
            let expr = expr.as_str().ok_or_else(|| RuleError::InvalidDirective {
                directive: "$data".to_string(),
                message: format!("field '{}' must be a string", key),
            })?;
            data.insert(key.clone(), Pipeline::parse(expr)?);
        }
    }

    let id = Pipeline::parse_optional(get_str(map, "$id")?)?;

    match get_str(map, "$each")? {
        Some(each) if !each.trim().is_empty() => Ok(Output::List(ListOutput {
            name,
            each: each.trim().to_string(),
            data,
            id,
        })),
        _ => Ok(Output::Object(ObjectOutput { name, data, id })),
    }
}
