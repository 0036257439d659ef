//! Declarative field extraction.
//!
//! A field is an ordered list of attempts. Each attempt locates strings in
//! the response, optionally filters them through a regex, and optionally
//! joins them. The first attempt that yields anything wins; later attempts
//! are never merged in.
//!
//! HTML locators are XPath expressions or CSS selectors. XPath is used for
//! paths, groups and function calls:
//!
//! - `//div[@class="author"]/text()` selects text nodes.
//! - `//a[@rel="next"]/@href` selects attribute values.
//! - `normalize-space(//h1)` yields a single string.
//!
//! CSS selectors take a leaf suffix:
//!
//! - `h1.title::text` selects the normalised text of each match.
//! - `a.next::attr(href)` selects an attribute value.
//!
//! A locator that points at element nodes rather than strings makes the
//! attempt come up empty. JSON locators are key paths joined with `&&`,
//! e.g. `data&&items&&0&&name`.

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;
use sxd_document::Package;
use sxd_document::dom::{Document, Element};
use sxd_xpath::nodeset::Node as XmlNode;
use sxd_xpath::{Context, Factory, XPath};

use crate::error::AppError;
use crate::response::Response;

/// Separator between keys of a JSON key path.
pub const KEY_SEPARATOR: &str = "&&";

/// One extraction attempt as written in a harvest file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct AttemptConfig {
    #[serde(alias = "xpath")]
    pub locator: String,

    /// Keep only the first capture group of each located value.
    #[serde(default, alias = "patt")]
    pub pattern: Option<String>,

    #[serde(default)]
    pub case_sensitive: bool,

    /// Join surviving values into one space-separated string.
    #[serde(default)]
    pub join: bool,
}

impl AttemptConfig {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            pattern: None,
            case_sensitive: false,
            join: false,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn joined(mut self) -> Self {
        self.join = true;
        self
    }
}

/// A single attempt: either a bare locator or a full attempt object.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum AttemptEntry {
    Locator(String),
    Attempt(AttemptConfig),
}

impl From<AttemptEntry> for AttemptConfig {
    fn from(entry: AttemptEntry) -> Self {
        match entry {
            AttemptEntry::Locator(locator) => AttemptConfig::new(locator),
            AttemptEntry::Attempt(config) => config,
        }
    }
}

/// How a field is declared: one attempt or an ordered list of them.
// `Many` goes first: an untagged struct also accepts a sequence.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldConfig {
    Many(Vec<AttemptEntry>),
    One(AttemptEntry),
}

impl FieldConfig {
    pub fn attempts(&self) -> Vec<AttemptConfig> {
        match self {
            FieldConfig::One(entry) => vec![entry.clone().into()],
            FieldConfig::Many(entries) => entries.iter().cloned().map(Into::into).collect(),
        }
    }
}

impl From<&str> for FieldConfig {
    fn from(locator: &str) -> Self {
        FieldConfig::One(AttemptEntry::Locator(locator.to_string()))
    }
}

impl From<AttemptConfig> for FieldConfig {
    fn from(attempt: AttemptConfig) -> Self {
        FieldConfig::One(AttemptEntry::Attempt(attempt))
    }
}

impl From<Vec<AttemptConfig>> for FieldConfig {
    fn from(attempts: Vec<AttemptConfig>) -> Self {
        FieldConfig::Many(attempts.into_iter().map(AttemptEntry::Attempt).collect())
    }
}

/// Extracted value of one field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    List(Vec<String>),
    Joined(String),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::List(values) => values.is_empty(),
            FieldValue::Joined(value) => value.is_empty(),
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Which structured form of the response the locators run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Html,
    Json,
}

#[derive(Debug)]
enum Leaf {
    Text,
    Attr(String),
    Node,
}

#[derive(Debug)]
enum Locator {
    Css { selector: Selector, leaf: Leaf },
    // Kept as source: compiled expressions are not `Send`.
    XPath(String),
    KeyPath(Vec<String>),
}

#[derive(Debug)]
struct Attempt {
    source: String,
    locator: Locator,
    pattern: Option<Regex>,
    join: bool,
}

/// Compiled field declarations, ready to run against responses.
#[derive(Debug)]
pub struct FieldSet {
    kind: FieldKind,
    fields: Vec<(String, Vec<Attempt>)>,
}

impl FieldSet {
    /// Compiles fields whose locators are XPath expressions or CSS selectors.
    pub fn html(configs: &BTreeMap<String, FieldConfig>) -> Result<Self, AppError> {
        Self::compile(FieldKind::Html, configs)
    }

    /// Compiles fields whose locators are JSON key paths.
    pub fn json(configs: &BTreeMap<String, FieldConfig>) -> Result<Self, AppError> {
        Self::compile(FieldKind::Json, configs)
    }

    fn compile(kind: FieldKind, configs: &BTreeMap<String, FieldConfig>) -> Result<Self, AppError> {
        let mut fields = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            let attempts = config
                .attempts()
                .into_iter()
                .map(|attempt| compile_attempt(kind, attempt))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Config(format!("Field {name:?}: {e}")))?;
            if attempts.is_empty() {
                return Err(AppError::Config(format!("Field {name:?} has no attempts")));
            }
            fields.push((name.clone(), attempts));
        }
        Ok(Self { kind, fields })
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Runs every field against `response`.
    ///
    /// A field where no attempt yields anything maps to an empty list.
    pub fn extract(&self, response: &Response) -> FieldMap {
        // XML copy of the page, built on the first XPath attempt.
        let mut xml = None;
        let mut out = FieldMap::new();
        for (name, attempts) in &self.fields {
            let value = attempts
                .iter()
                .find_map(|attempt| run_attempt(attempt, response, &mut xml))
                .unwrap_or(FieldValue::List(Vec::new()));
            out.insert(name.clone(), value);
        }
        out
    }
}

fn compile_attempt(kind: FieldKind, config: AttemptConfig) -> Result<Attempt, String> {
    let locator = match kind {
        FieldKind::Html if is_xpath(&config.locator) => compile_xpath(&config.locator)?,
        FieldKind::Html => compile_css(&config.locator)?,
        FieldKind::Json => Locator::KeyPath(
            config
                .locator
                .split(KEY_SEPARATOR)
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        ),
    };

    let pattern = config
        .pattern
        .as_deref()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(!config.case_sensitive)
                .build()
                .map_err(|e| format!("invalid pattern {p:?}: {e}"))
        })
        .transpose()?;

    Ok(Attempt {
        source: config.locator,
        locator,
        pattern,
        join: config.join,
    })
}

/// Paths (`/`, `./`, `..`), groups and function calls such as
/// `normalize-space(...)` are XPath; everything else is CSS.
fn is_xpath(locator: &str) -> bool {
    let locator = locator.trim_start();
    if locator.starts_with(['/', '(']) || locator.starts_with("./") || locator.starts_with("..") {
        return true;
    }
    let name_len = locator
        .find(|c: char| !(c.is_ascii_lowercase() || c == '-'))
        .unwrap_or(locator.len());
    name_len > 0 && locator[name_len..].starts_with('(')
}

fn build_xpath(expression: &str) -> Result<XPath, String> {
    Factory::new()
        .build(expression)
        .map_err(|e| format!("invalid xpath {expression:?}: {e:?}"))?
        .ok_or_else(|| format!("empty xpath {expression:?}"))
}

fn compile_xpath(locator: &str) -> Result<Locator, String> {
    let expression = locator.trim();
    build_xpath(expression)?;
    Ok(Locator::XPath(expression.to_string()))
}

fn compile_css(locator: &str) -> Result<Locator, String> {
    let locator = locator.trim();
    let (selector, leaf) = if let Some(selector) = locator.strip_suffix("::text") {
        (selector, Leaf::Text)
    } else if let Some((selector, attr)) = locator
        .strip_suffix(')')
        .and_then(|rest| rest.rsplit_once("::attr("))
    {
        (selector, Leaf::Attr(attr.trim().to_string()))
    } else {
        (locator, Leaf::Node)
    };

    let selector =
        Selector::parse(selector).map_err(|e| format!("invalid selector {selector:?}: {e}"))?;
    Ok(Locator::Css { selector, leaf })
}

/// Runs one attempt. `None` means "nothing here, try the next one".
fn run_attempt(
    attempt: &Attempt,
    response: &Response,
    xml: &mut Option<Package>,
) -> Option<FieldValue> {
    let located = match &attempt.locator {
        Locator::Css { selector, leaf } => {
            select_html(response.document(), selector, leaf, &attempt.source)
        }
        Locator::XPath(expression) => {
            let package = xml.get_or_insert_with(|| xml_copy(response.document()));
            select_xpath(package, expression, &attempt.source)
        }
        Locator::KeyPath(keys) => match response.json() {
            Some(value) => select_json(value, keys, &attempt.source),
            None => Ok(Vec::new()),
        },
    };

    let values = match located {
        Ok(values) => values,
        Err(err) => {
            tracing::debug!(error = %err, "Skipping field attempt");
            return None;
        }
    };

    let values = match &attempt.pattern {
        Some(pattern) => apply_pattern(pattern, values),
        None => values,
    };

    if values.is_empty() {
        None
    } else if attempt.join {
        Some(FieldValue::Joined(values.join(" ")))
    } else {
        Some(FieldValue::List(values))
    }
}

fn select_html(
    document: &Html,
    selector: &Selector,
    leaf: &Leaf,
    source: &str,
) -> Result<Vec<String>, AppError> {
    match leaf {
        Leaf::Text => Ok(document
            .select(selector)
            .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
            .filter(|text| !text.is_empty())
            .collect()),
        Leaf::Attr(name) => Ok(document
            .select(selector)
            .filter_map(|el| el.value().attr(name))
            .map(|value| value.trim().to_string())
            .collect()),
        Leaf::Node => {
            if document.select(selector).next().is_some() {
                Err(AppError::WrongFieldType {
                    locator: source.to_string(),
                })
            } else {
                Ok(Vec::new())
            }
        }
    }
}

/// Copies elements, attributes and text of `html` into an XML document.
fn xml_copy(html: &Html) -> Package {
    let package = Package::new();
    {
        let doc = package.as_document();
        let root = html.root_element();
        let element = doc.create_element(root.value().name());
        doc.root().append_child(element);
        copy_children(doc, element, root);
    }
    package
}

fn copy_children<'d>(doc: Document<'d>, target: Element<'d>, source: ElementRef<'_>) {
    for (name, value) in source.value().attrs() {
        target.set_attribute_value(name, value);
    }
    for child in source.children() {
        match child.value() {
            Node::Element(el) => {
                let element = doc.create_element(el.name());
                target.append_child(element);
                if let Some(child) = ElementRef::wrap(child) {
                    copy_children(doc, element, child);
                }
            }
            Node::Text(text) => target.append_child(doc.create_text(&**text)),
            _ => {}
        }
    }
}

fn select_xpath(
    package: &Package,
    expression: &str,
    source: &str,
) -> Result<Vec<String>, AppError> {
    let doc = package.as_document();
    let xpath = build_xpath(expression).map_err(AppError::Generic)?;
    let value = xpath
        .evaluate(&Context::new(), doc.root())
        .map_err(|e| AppError::Generic(format!("{source}: {e:?}")))?;

    let mut out = Vec::new();
    match value {
        sxd_xpath::Value::Nodeset(nodes) => {
            for node in nodes.document_order() {
                let text = match node {
                    XmlNode::Text(text) => normalize_text(text.text()),
                    XmlNode::Attribute(attr) => attr.value().trim().to_string(),
                    _ => {
                        return Err(AppError::WrongFieldType {
                            locator: source.to_string(),
                        });
                    }
                };
                if !text.is_empty() {
                    out.push(text);
                }
            }
        }
        sxd_xpath::Value::String(text) => {
            let text = normalize_text(&text);
            if !text.is_empty() {
                out.push(text);
            }
        }
        sxd_xpath::Value::Number(n) if n.is_finite() => out.push(n.to_string()),
        sxd_xpath::Value::Number(_) => {}
        sxd_xpath::Value::Boolean(b) => out.push(b.to_string()),
    }
    Ok(out)
}

fn select_json(value: &Value, keys: &[String], source: &str) -> Result<Vec<String>, AppError> {
    let mut node = value;
    for key in keys {
        let next = match node {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(next) => node = next,
            None => return Ok(Vec::new()),
        }
    }

    let mut out = Vec::new();
    collect_leaves(node, source, &mut out)?;
    Ok(out)
}

fn collect_leaves(node: &Value, source: &str, out: &mut Vec<String>) -> Result<(), AppError> {
    match node {
        Value::Null => {}
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                collect_leaves(item, source, out)?;
            }
        }
        Value::Object(_) => {
            return Err(AppError::WrongFieldType {
                locator: source.to_string(),
            });
        }
    }
    Ok(())
}

/// Keeps the first capture group of each match (the whole match when the
/// pattern has no groups) and drops values that do not match.
fn apply_pattern(pattern: &Regex, values: Vec<String>) -> Vec<String> {
    let grouped = pattern.captures_len() > 1;
    values
        .iter()
        .filter_map(|value| {
            let caps = pattern.captures(value)?;
            let m = if grouped { caps.get(1)? } else { caps.get(0)? };
            Some(m.as_str().to_string())
        })
        .collect()
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
