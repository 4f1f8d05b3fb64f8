//! Wildcard Templates
//!
//! File-path templates with named placeholders, e.g. `trimmed/{sample}.fastq`.
//!
//! - [`Template::matches`] binds a concrete path to wildcard values
//! - [`Template::instantiate`] fills a template from a binding
//! - [`render`] fills command templates from an arbitrary lookup
//! - [`expand`] produces every path of a template over value lists
//!
//! A placeholder may carry its own pattern, `{sample,[A-Z0-9]+}`; otherwise
//! the pipeline-wide constraint for that name is used, falling back to `.+`.
//! `{{` and `}}` are literal braces.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use regex::Regex;

use crate::error::TemplateError;

/// Concrete wildcard values of one task instance.
///
/// Ordered so that bindings can be hashed, compared and printed
/// deterministically.
pub type Binding = BTreeMap<String, String>;

/// Pattern used for wildcards without an explicit constraint.
const DEFAULT_WILDCARD_PATTERN: &str = ".+";

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder {
        name: String,
        constraint: Option<String>,
    },
}

/// Splits a template into literal text and placeholders.
///
/// Braces inside a placeholder nest, so constraints such as
/// `{lane,L[0-9]{3}}` parse as one placeholder.
pub fn parse_segments(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.char_indices().peekable();

    while let Some((position, ch)) = chars.next() {
        match ch {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                literal.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut depth = 1;
                let mut body = String::new();
                for (_, inner) in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(inner);
                }
                if depth != 0 {
                    return Err(TemplateError::Unclosed {
                        template: template.to_string(),
                        position,
                    });
                }

                let (name, constraint) = match body.split_once(',') {
                    Some((name, constraint)) => {
                        (name.trim().to_string(), Some(constraint.trim().to_string()))
                    }
                    None => (body.trim().to_string(), None),
                };
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder {
                        template: template.to_string(),
                    });
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder { name, constraint });
            }
            '}' => {
                return Err(TemplateError::Unmatched {
                    template: template.to_string(),
                    position,
                });
            }
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    parse_segments(text)
        .map(|segments| {
            segments
                .iter()
                .any(|s| matches!(s, Segment::Placeholder { .. }))
        })
        .unwrap_or(false)
}

/// Returns the placeholder names of a template in order of first use.
///
/// # Example
/// ```
/// use seqflow::workflow::wildcards::extract_wildcard_names;
///
/// let names = extract_wildcard_names("{sample}_{lane}.{sample}.fastq").unwrap();
/// assert_eq!(names, vec!["sample", "lane"]);
/// ```
pub fn extract_wildcard_names(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse_segments(template)? {
        if let Segment::Placeholder { name, .. } = segment {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Splits an indexed placeholder such as `input[2]` into `("input", 2)`.
pub fn parse_indexed(name: &str) -> Option<(&str, usize)> {
    let (base, rest) = name.split_once('[')?;
    let index = rest.strip_suffix(']')?.parse().ok()?;
    Some((base, index))
}

/// A compiled file-path template.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
    regex: Regex,
    /// Capture group `w{i}` binds wildcard `groups[i]`.
    groups: Vec<String>,
}

impl Template {
    /// Parses a template with no pipeline-wide constraints.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        Self::with_constraints(raw, &BTreeMap::new())
    }

    /// Parses a template, using `constraints` for wildcards that do not
    /// carry their own pattern.
    pub fn with_constraints(
        raw: &str,
        constraints: &BTreeMap<String, String>,
    ) -> Result<Self, TemplateError> {
        let segments = parse_segments(raw)?;
        let mut pattern = String::from("^");
        let mut groups = Vec::new();

        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Placeholder { name, constraint } => {
                    let inner = constraint
                        .as_deref()
                        .or_else(|| constraints.get(name).map(String::as_str))
                        .unwrap_or(DEFAULT_WILDCARD_PATTERN);

                    // Validate each constraint on its own so errors name the wildcard.
                    Regex::new(inner).map_err(|source| TemplateError::Constraint {
                        template: raw.to_string(),
                        name: name.clone(),
                        source,
                    })?;

                    pattern.push_str(&format!("(?P<w{}>{})", groups.len(), inner));
                    groups.push(name.clone());
                }
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|source| TemplateError::Constraint {
            template: raw.to_string(),
            name: groups.last().cloned().unwrap_or_default(),
            source,
        })?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
            regex,
            groups,
        })
    }

    /// Returns the template text as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the wildcard names in order of first use.
    pub fn wildcard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in &self.groups {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Returns the set of wildcard names.
    pub fn wildcard_set(&self) -> BTreeSet<String> {
        self.groups.iter().cloned().collect()
    }

    /// Returns true if the template has at least one wildcard.
    pub fn has_wildcards(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Matches a concrete path against the whole template.
    ///
    /// Returns `None` if the path does not match, or if a repeated wildcard
    /// would have to take two different values.
    pub fn matches(&self, path: &str) -> Option<Binding> {
        let captures = self.regex.captures(path)?;
        let mut binding = Binding::new();

        for (index, name) in self.groups.iter().enumerate() {
            let value = captures.name(&format!("w{}", index))?.as_str();
            match binding.get(name) {
                Some(existing) if existing != value => {
                    debug!(
                        "'{}' binds {{{}}} to both '{}' and '{}'",
                        path, name, existing, value
                    );
                    return None;
                }
                Some(_) => {}
                None => {
                    binding.insert(name.clone(), value.to_string());
                }
            }
        }

        Some(binding)
    }

    /// Fills every wildcard from `binding`.
    pub fn instantiate(&self, binding: &Binding) -> Result<String, TemplateError> {
        let mut path = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => path.push_str(text),
                Segment::Placeholder { name, .. } => {
                    let value = binding.get(name).ok_or_else(|| TemplateError::Unbound {
                        template: self.raw.clone(),
                        name: name.clone(),
                    })?;
                    path.push_str(value);
                }
            }
        }
        Ok(path)
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.regex.as_str() == other.regex.as_str()
    }
}

/// Renders a command template, resolving each placeholder through `lookup`.
///
/// Placeholders that `lookup` does not know fail with
/// [`TemplateError::UnknownPlaceholder`]. Write `{{` and `}}` for literal
/// braces (e.g. in awk programs).
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut rendered = String::with_capacity(template.len());
    for segment in parse_segments(template)? {
        match segment {
            Segment::Literal(text) => rendered.push_str(&text),
            Segment::Placeholder { name, constraint } => {
                let key = match constraint {
                    Some(c) => format!("{},{}", name, c),
                    None => name,
                };
                let value = lookup(&key).ok_or_else(|| TemplateError::UnknownPlaceholder {
                    template: template.to_string(),
                    name: key.clone(),
                })?;
                rendered.push_str(&value);
            }
        }
    }
    Ok(rendered)
}

/// Expands a template over the cartesian product of the given values.
///
/// Paths are returned in a stable order without duplicates.
pub fn expand(
    template: &Template,
    values: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<String>, TemplateError> {
    let mut bindings = vec![Binding::new()];

    for name in template.wildcard_names() {
        let options = values.get(&name).ok_or_else(|| TemplateError::Unbound {
            template: template.as_str().to_string(),
            name: name.clone(),
        })?;

        let key = name.as_str();
        bindings = bindings
            .into_iter()
            .flat_map(move |binding| {
                options.iter().map(move |value| {
                    let mut next = binding.clone();
                    next.insert(key.to_string(), value.clone());
                    next
                })
            })
            .collect();
    }

    let mut paths = Vec::with_capacity(bindings.len());
    for binding in &bindings {
        let path = template.instantiate(binding)?;
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Formats a binding as `name=value,...`.
pub fn describe(binding: &Binding) -> String {
    binding
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(pairs: &[(&str, &str)]) -> Binding {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_match_single_wildcard() {
        let template = Template::parse("trimmed/{sample}.fastq").unwrap();
        let bound = template.matches("trimmed/A1.fastq").unwrap();
        assert_eq!(bound, binding(&[("sample", "A1")]));
        assert!(template.matches("raw/A1.fastq").is_none());
        assert!(template.matches("trimmed/A1.fastq.gz").is_none());
    }

    #[test]
    fn test_round_trip_instantiate_then_match() {
        let templates = [
            "counts/{sample}.{stage}.count",
            "aligned/{sample}/{lane}.bam",
            "{sample}.bw",
            "qc/{sample}_R{read}.html",
        ];
        let values = binding(&[
            ("sample", "S01"),
            ("stage", "dedup"),
            ("lane", "L002"),
            ("read", "1"),
        ]);

        for raw in templates {
            let template = Template::parse(raw).unwrap();
            let own: Binding = values
                .iter()
                .filter(|(k, _)| template.wildcard_set().contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let path = template.instantiate(&own).unwrap();
            assert_eq!(template.matches(&path), Some(own), "template {}", raw);
        }
    }

    #[test]
    fn test_repeated_wildcard_must_agree() {
        let template = Template::parse("{sample}/{sample}.bam").unwrap();
        assert_eq!(
            template.matches("A/A.bam"),
            Some(binding(&[("sample", "A")]))
        );
        assert!(template.matches("A/B.bam").is_none());
    }

    #[test]
    fn test_inline_constraint() {
        let template = Template::parse("reads/{sample,[A-Z]+}.fastq").unwrap();
        assert!(template.matches("reads/ABC.fastq").is_some());
        assert!(template.matches("reads/abc.fastq").is_none());
        assert_eq!(template.wildcard_names(), vec!["sample"]);
    }

    #[test]
    fn test_nested_braces_in_constraint() {
        let template = Template::parse("{lane,L[0-9]{3}}.bam").unwrap();
        assert!(template.matches("L001.bam").is_some());
        assert!(template.matches("L01.bam").is_none());
    }

    #[test]
    fn test_pipeline_constraints_apply() {
        let mut constraints = BTreeMap::new();
        constraints.insert("sample".to_string(), "[^/.]+".to_string());
        let template = Template::with_constraints("{sample}.{stage}.count", &constraints).unwrap();

        // Unconstrained wildcards take the rest, dots included.
        let bound = template.matches("A.b.raw.count").unwrap();
        assert_eq!(bound["sample"], "A");
        assert_eq!(bound["stage"], "b.raw");

        constraints.insert("stage".to_string(), "[^/.]+".to_string());
        let strict = Template::with_constraints("{sample}.{stage}.count", &constraints).unwrap();
        assert!(strict.matches("A.b.raw.count").is_none());

        let bound = strict.matches("A.raw.count").unwrap();
        assert_eq!(bound["sample"], "A");
        assert_eq!(bound["stage"], "raw");
    }

    #[test]
    fn test_invalid_constraint() {
        let result = Template::parse("{sample,[}.txt");
        assert!(matches!(result, Err(TemplateError::Constraint { .. })));
    }

    #[test]
    fn test_unbalanced_braces() {
        assert!(matches!(
            parse_segments("{sample.txt"),
            Err(TemplateError::Unclosed { .. })
        ));
        assert!(matches!(
            parse_segments("sample}.txt"),
            Err(TemplateError::Unmatched { .. })
        ));
        assert!(matches!(
            parse_segments("{}.txt"),
            Err(TemplateError::EmptyPlaceholder { .. })
        ));
    }

    #[test]
    fn test_escaped_braces_are_literal() {
        let segments = parse_segments("awk '{{print $1}}' {input}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("awk '{print $1}' ".to_string()),
                Segment::Placeholder {
                    name: "input".to_string(),
                    constraint: None
                },
            ]
        );
    }

    #[test]
    fn test_instantiate_unbound() {
        let template = Template::parse("{sample}.{stage}.count").unwrap();
        let result = template.instantiate(&binding(&[("sample", "A")]));
        assert!(matches!(result, Err(TemplateError::Unbound { name, .. }) if name == "stage"));
    }

    #[test]
    fn test_render_with_lookup() {
        let rendered = render("cat {input} | wc -l > {output}", |name| match name {
            "input" => Some("a.txt".to_string()),
            "output" => Some("n.txt".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(rendered, "cat a.txt | wc -l > n.txt");

        let unknown = render("echo {nope}", |_| None);
        assert!(matches!(unknown, Err(TemplateError::UnknownPlaceholder { .. })));
    }

    #[test]
    fn test_expand_cartesian_product() {
        let template = Template::parse("counts/{sample}.{stage}.count").unwrap();
        let mut values = BTreeMap::new();
        values.insert("sample".to_string(), vec!["A".to_string(), "B".to_string()]);
        values.insert(
            "stage".to_string(),
            vec!["raw".to_string(), "trimmed".to_string()],
        );

        let paths = expand(&template, &values).unwrap();
        assert_eq!(
            paths,
            vec![
                "counts/A.raw.count",
                "counts/A.trimmed.count",
                "counts/B.raw.count",
                "counts/B.trimmed.count",
            ]
        );
    }

    #[test]
    fn test_expand_missing_values() {
        let template = Template::parse("{sample}.txt").unwrap();
        assert!(expand(&template, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{sample}.fastq"));
        assert!(has_wildcards("output/{id}.txt"));
        assert!(!has_wildcards("regular_file.txt"));
        assert!(!has_wildcards("literal_{{braces}}.txt"));
    }

    #[test]
    fn test_parse_indexed() {
        assert_eq!(parse_indexed("input[0]"), Some(("input", 0)));
        assert_eq!(parse_indexed("output[12]"), Some(("output", 12)));
        assert_eq!(parse_indexed("input"), None);
        assert_eq!(parse_indexed("input[x]"), None);
    }

    #[test]
    fn test_describe_binding() {
        let bound = binding(&[("stage", "raw"), ("sample", "A")]);
        assert_eq!(describe(&bound), "sample=A,stage=raw");
    }
}
