//! CSS-like stylesheet system for injecting default attributes into pipeline
//! graph nodes.
//!
//! Parses stylesheet rules with selectors (`*`, bare shape identifiers,
//! `.class`, `#id`) and arbitrary `property: value` declarations, then
//! applies them to pipeline graph nodes respecting specificity ordering.

use crate::graph::PipelineNode;
use crate::PipelineGraph;
use pipeweave_dot::AttributeValue;
use pipeweave_types::PipeweaveError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub selector: Selector,
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// `*` — matches every node.
    Universal,
    /// bare identifier — matches the node's `shape` attribute literally.
    Shape(String),
    /// `.class_name` — matches nodes whose comma/space-separated `class`
    /// attribute contains the value.
    Class(String),
    /// `#node_id` — matches a node by its id.
    Id(String),
}

impl Selector {
    /// Fixed specificity per kind: universal 0, shape 0.5, class 1, id 2.
    /// Represented as tenths of a point so it stays comparable with `Ord`.
    pub fn specificity(&self) -> u32 {
        match self {
            Selector::Universal => 0,
            Selector::Shape(_) => 5,
            Selector::Class(_) => 10,
            Selector::Id(_) => 20,
        }
    }

    pub fn matches(&self, node: &PipelineNode) -> bool {
        match self {
            Selector::Universal => true,
            Selector::Id(id) => node.id == *id,
            Selector::Shape(shape) => node.shape == *shape,
            Selector::Class(class) => node.classes.iter().any(|c| c == class),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.input.len()
                && self.input.as_bytes()[self.pos].is_ascii_whitespace()
            {
                self.pos += 1;
            }
            if self.remaining().starts_with("//") {
                while self.pos < self.input.len() && self.input.as_bytes()[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            if self.remaining().starts_with("/*") {
                self.pos += 2;
                while self.pos + 1 < self.input.len() {
                    if &self.input[self.pos..self.pos + 2] == "*/" {
                        self.pos += 2;
                        break;
                    }
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, ch: u8) -> Result<(), PipeweaveError> {
        self.skip_whitespace_and_comments();
        match self.peek() {
            Some(c) if c == ch => {
                self.pos += 1;
                Ok(())
            }
            other => Err(self.error(format!(
                "expected '{}', found '{}'",
                ch as char,
                other.map(|c| c as char).unwrap_or('\0')
            ))),
        }
    }

    fn parse_identifier(&mut self) -> Result<String, PipeweaveError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input.as_bytes()[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected identifier".to_string()));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_value(&mut self) -> Result<String, PipeweaveError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input.as_bytes()[self.pos];
            if c == b';' || c == b'}' {
                break;
            }
            self.pos += 1;
        }
        let val = self.input[start..self.pos].trim();
        if val.is_empty() {
            return Err(self.error("expected property value".to_string()));
        }
        Ok(val.to_string())
    }

    fn error(&self, message: String) -> PipeweaveError {
        let consumed = &self.input[..self.pos];
        let line = consumed.chars().filter(|&c| c == '\n').count() + 1;
        let col = consumed.rfind('\n').map(|i| self.pos - i).unwrap_or(self.pos + 1);
        PipeweaveError::ParseError {
            line,
            col,
            message,
            source_snippet: None,
        }
    }

    fn parse_selector(&mut self) -> Result<Selector, PipeweaveError> {
        self.skip_whitespace_and_comments();
        match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                Ok(Selector::Universal)
            }
            Some(b'#') => {
                self.pos += 1;
                let id = self.parse_identifier()?;
                Ok(Selector::Id(id))
            }
            Some(b'.') => {
                self.pos += 1;
                let class = self.parse_identifier()?;
                Ok(Selector::Class(class))
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let shape = self.parse_identifier()?;
                Ok(Selector::Shape(shape))
            }
            other => Err(self.error(format!(
                "expected selector ('*', bare shape identifier, '.', or '#'), found '{}'",
                other.map(|c| c as char).unwrap_or('\0')
            ))),
        }
    }

    fn parse_declaration(&mut self) -> Result<Declaration, PipeweaveError> {
        let property = self.parse_identifier()?;
        self.expect(b':')?;
        let value = self.parse_value()?;
        Ok(Declaration { property, value })
    }

    fn parse_rule(&mut self) -> Result<Option<Rule>, PipeweaveError> {
        let selector = self.parse_selector()?;
        self.expect(b'{')?;

        let mut declarations = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.error("unexpected end of input in rule body".to_string())),
                _ => {
                    let decl = self.parse_declaration()?;
                    declarations.push(decl);
                    self.skip_whitespace_and_comments();
                    if self.peek() == Some(b';') {
                        self.pos += 1;
                    }
                }
            }
        }

        // An empty declaration body is dropped rather than producing a
        // no-op rule.
        if declarations.is_empty() {
            return Ok(None);
        }

        Ok(Some(Rule {
            selector,
            declarations,
        }))
    }

    fn parse_stylesheet(&mut self) -> Result<Stylesheet, PipeweaveError> {
        let mut rules = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.pos >= self.input.len() {
                break;
            }
            if let Some(rule) = self.parse_rule()? {
                rules.push(rule);
            }
        }
        Ok(Stylesheet { rules })
    }
}

/// Parse a stylesheet from a string. An empty or whitespace-only input
/// yields a stylesheet with no rules, not an error.
pub fn parse_stylesheet(input: &str) -> Result<Stylesheet, PipeweaveError> {
    let mut parser = Parser::new(input);
    parser.parse_stylesheet()
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply a stylesheet to a `PipelineGraph`, mutating nodes in place.
///
/// Rules are sorted by ascending specificity with a stable sort, so
/// equal-specificity rules apply in source order (later wins at equal
/// specificity). A declaration is only written if the node does not already
/// carry that attribute explicitly — stylesheet injection never overrides an
/// attribute the node declared itself.
pub fn apply_stylesheet(graph: &mut PipelineGraph, stylesheet: &Stylesheet) {
    for node in graph.all_nodes_mut() {
        let mut matching: Vec<&Rule> = stylesheet
            .rules
            .iter()
            .filter(|r| r.selector.matches(node))
            .collect();
        matching.sort_by_key(|r| r.selector.specificity());

        let mut changed = false;
        for rule in matching {
            for decl in &rule.declarations {
                if node.has_explicit(&decl.property) {
                    continue;
                }
                node.raw_attrs.insert(
                    decl.property.clone(),
                    AttributeValue::String(decl.value.clone()),
                );
                changed = true;
            }
        }
        if changed {
            node.refresh_derived();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_universal_selector_rule() {
        let css = r#"* { llm_model: claude-sonnet-4-20250514; }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules.len(), 1);
        assert_eq!(ss.rules[0].selector, Selector::Universal);
        assert_eq!(ss.rules[0].declarations[0].property, "llm_model");
        assert_eq!(ss.rules[0].declarations[0].value, "claude-sonnet-4-20250514");
    }

    #[test]
    fn parse_shape_selector_rule() {
        let css = r#"box { retry_policy: aggressive; }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules[0].selector, Selector::Shape("box".to_string()));
    }

    #[test]
    fn parse_id_selector_rule() {
        let css = r#"#summarize { llm_model: claude; timeout_seconds: 30; }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules.len(), 1);
        assert_eq!(ss.rules[0].selector, Selector::Id("summarize".to_string()));
        assert_eq!(ss.rules[0].declarations.len(), 2);
    }

    #[test]
    fn parse_class_selector_rule() {
        let css = r#".fast { llm_model: gpt-4o-mini; }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules[0].selector, Selector::Class("fast".to_string()));
    }

    #[test]
    fn parse_trailing_semicolon_optional() {
        let css = r#"* { llm_model: m }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules[0].declarations[0].value, "m");
    }

    #[test]
    fn empty_declaration_body_dropped() {
        let css = r#"* { } .fast { llm_model: m; }"#;
        let ss = parse_stylesheet(css).unwrap();
        assert_eq!(ss.rules.len(), 1);
        assert_eq!(ss.rules[0].selector, Selector::Class("fast".to_string()));
    }

    #[test]
    fn parse_empty_input_yields_no_rules() {
        let ss = parse_stylesheet("   ").unwrap();
        assert!(ss.rules.is_empty());
    }

    // --- Application tests ---

    fn make_test_graph() -> PipelineGraph {
        let dot = r#"digraph G {
            start [shape="Mdiamond"]
            analyze [label="Analyze", class="fast"]
            summarize [label="Summarize", class="slow"]
            done [shape="Msquare"]
            start -> analyze -> summarize -> done
        }"#;
        let graph = pipeweave_dot::parse(dot).unwrap();
        PipelineGraph::from_dot(graph).unwrap()
    }

    #[test]
    fn apply_universal_sets_model_on_all_nodes() {
        let mut graph = make_test_graph();
        let ss = parse_stylesheet(r#"* { llm_model: default-model; }"#).unwrap();
        apply_stylesheet(&mut graph, &ss);

        for node in graph.all_nodes() {
            assert_eq!(node.llm_model.as_deref(), Some("default-model"));
        }
    }

    #[test]
    fn apply_id_overrides_class_specificity() {
        let mut graph = make_test_graph();
        let css = r#"
            .fast { llm_model: fast-model; }
            #analyze { llm_model: analyze-model; }
        "#;
        let ss = parse_stylesheet(css).unwrap();
        apply_stylesheet(&mut graph, &ss);

        let node = graph.node("analyze").unwrap();
        assert_eq!(node.llm_model.as_deref(), Some("analyze-model"));
    }

    #[test]
    fn shape_wins_over_universal_but_loses_to_class() {
        let mut graph = make_test_graph();
        let css = r#"
            * { llm_model: universal-model; }
            box { llm_model: shape-model; }
            .fast { llm_model: class-model; }
        "#;
        let ss = parse_stylesheet(css).unwrap();
        apply_stylesheet(&mut graph, &ss);

        // "analyze" defaults to shape=box and has class "fast".
        assert_eq!(graph.node("analyze").unwrap().llm_model.as_deref(), Some("class-model"));
        // "summarize" is shape=box, class="slow" (no rule) so shape wins over universal.
        assert_eq!(graph.node("summarize").unwrap().llm_model.as_deref(), Some("shape-model"));
    }

    #[test]
    fn explicit_node_attribute_overrides_stylesheet() {
        let dot = r#"digraph G {
            work [llm_model="explicit-model"]
        }"#;
        let graph_dot = pipeweave_dot::parse(dot).unwrap();
        let mut graph = PipelineGraph::from_dot(graph_dot).unwrap();

        let ss = parse_stylesheet(r#"* { llm_model: stylesheet-model; }"#).unwrap();
        apply_stylesheet(&mut graph, &ss);

        let node = graph.node("work").unwrap();
        assert_eq!(node.llm_model.as_deref(), Some("explicit-model"));
    }

    #[test]
    fn stylesheet_can_set_arbitrary_attribute() {
        let mut graph = make_test_graph();
        let ss = parse_stylesheet(r#"* { retry_policy: patient; }"#).unwrap();
        apply_stylesheet(&mut graph, &ss);

        for node in graph.all_nodes() {
            assert_eq!(node.retry_policy, "patient");
        }
    }

    #[test]
    fn specificity_ordering() {
        assert!(Selector::Universal.specificity() < Selector::Shape("x".into()).specificity());
        assert!(Selector::Shape("x".into()).specificity() < Selector::Class("x".into()).specificity());
        assert!(Selector::Class("x".into()).specificity() < Selector::Id("x".into()).specificity());
    }

    #[test]
    fn later_rule_wins_at_equal_specificity() {
        let mut graph = make_test_graph();
        let css = r#"
            * { llm_model: first; }
            * { llm_model: second; }
        "#;
        let ss = parse_stylesheet(css).unwrap();
        apply_stylesheet(&mut graph, &ss);
        assert_eq!(graph.node("done").unwrap().llm_model.as_deref(), Some("second"));
    }
}
