//! Sources bind URL patterns to a scraper and a set of fields; the router
//! picks the most specific source for a URL.

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};

use crate::error::AppError;
use crate::field::{FieldConfig, FieldSet};
use crate::scrape::Scraper;
use crate::traits::Backend;

/// Added to an endpoint's specificity so it outranks any HTML pattern.
pub const ENDPOINT_BONUS: usize = 999;

/// A site or API endpoint the harvester knows how to handle.
pub struct Source<B> {
    name: String,
    patterns: Vec<Regex>,
    specificity: usize,
    template: Option<String>,
    scraper: Scraper<B>,
    fields: FieldSet,
}

impl<B: Backend> Source<B> {
    /// An HTML source matched by regex `patterns`. `*` matches every URL.
    pub fn html(
        name: impl Into<String>,
        patterns: &[String],
        scraper: Scraper<B>,
        fields: &BTreeMap<String, FieldConfig>,
    ) -> Result<Self, AppError> {
        let name = name.into();
        if patterns.is_empty() {
            return Err(AppError::Config(format!("Source {name:?} has no URL patterns")));
        }

        let specificity = patterns.iter().map(String::len).max().unwrap_or(0);
        let patterns = patterns
            .iter()
            .map(|p| if p == "*" { ".*" } else { p.as_str() })
            .map(|p| compile_pattern(&name, p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            fields: FieldSet::html(fields)?,
            name,
            patterns,
            specificity,
            template: None,
            scraper,
        })
    }

    /// A JSON endpoint built from a URL template such as
    /// `https://api.example.com/v1/items/{id}`.
    ///
    /// The scheme is dropped and every `{key}` placeholder matches anything.
    pub fn endpoint(
        name: impl Into<String>,
        template: impl Into<String>,
        scraper: Scraper<B>,
        fields: &BTreeMap<String, FieldConfig>,
    ) -> Result<Self, AppError> {
        let name = name.into();
        let template = template.into();

        let without_scheme = template
            .split_once("://")
            .map_or(template.as_str(), |(_, rest)| rest);
        let pattern: String = split_template(without_scheme)?
            .into_iter()
            .map(|segment| match segment {
                Segment::Literal(text) => regex::escape(text),
                Segment::Param(_) => ".*".to_string(),
            })
            .collect();

        Ok(Self {
            fields: FieldSet::json(fields)?,
            specificity: pattern.len() + ENDPOINT_BONUS,
            patterns: vec![compile_pattern(&name, &pattern)?],
            name,
            template: Some(template),
            scraper,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn is_endpoint(&self) -> bool {
        self.template.is_some()
    }

    pub fn scraper(&self) -> &Scraper<B> {
        &self.scraper
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Case-insensitive search of `url` against every pattern.
    pub fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }

    /// Fills the endpoint template with `params`.
    pub fn endpoint_url(&self, params: &BTreeMap<String, String>) -> Result<String, AppError> {
        let template = self
            .template
            .as_deref()
            .ok_or_else(|| AppError::Config(format!("Source {:?} is not an endpoint", self.name)))?;

        let mut url = String::with_capacity(template.len());
        for segment in split_template(template)? {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Param(key) => {
                    let value = params.get(key).ok_or_else(|| {
                        AppError::Config(format!(
                            "Endpoint {:?} needs a value for {{{key}}}",
                            self.name
                        ))
                    })?;
                    url.push_str(value);
                }
            }
        }
        Ok(url)
    }
}

/// Ordered set of sources.
pub struct SourceRouter<B> {
    sources: Vec<Source<B>>,
}

impl<B: Backend> Default for SourceRouter<B> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
        }
    }
}

impl<B: Backend> SourceRouter<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source. Names must be unique.
    pub fn register(&mut self, source: Source<B>) -> Result<(), AppError> {
        if self.get(source.name()).is_some() {
            return Err(AppError::Config(format!(
                "Source {:?} is registered twice",
                source.name()
            )));
        }
        tracing::debug!(
            source = source.name(),
            specificity = source.specificity(),
            "Registered source"
        );
        self.sources.push(source);
        Ok(())
    }

    pub fn with(mut self, source: Source<B>) -> Result<Self, AppError> {
        self.register(source)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Source<B>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    pub fn sources(&self) -> &[Source<B>] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The most specific source matching `url`. On a tie the source
    /// registered first wins.
    pub fn resolve(&self, url: &str) -> Result<&Source<B>, AppError> {
        let mut best: Option<&Source<B>> = None;
        for source in self.sources.iter().filter(|s| s.matches(url)) {
            if best.is_none_or(|b| source.specificity() > b.specificity()) {
                best = Some(source);
            }
        }
        best.ok_or_else(|| AppError::UnconfiguredSource {
            url: url.to_string(),
        })
    }
}

fn compile_pattern(name: &str, pattern: &str) -> Result<Regex, AppError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AppError::Config(format!("Source {name:?} has invalid pattern {pattern:?}: {e}")))
}

enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn split_template(template: &str) -> Result<Vec<Segment<'_>>, AppError> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let close = rest[open..]
            .find('}')
            .map(|offset| open + offset)
            .ok_or_else(|| AppError::Config(format!("Unclosed placeholder in {template:?}")))?;
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        segments.push(Segment::Param(&rest[open + 1..close]));
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}
