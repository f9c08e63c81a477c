//! Object-key templates for release sources.
//!
//! A template mixes literal text with `{{ ... }}` actions. An action is a
//! field reference (`.Name`, `.Version`, `.StemcellOS`,
//! `.StemcellVersion`), a quoted string, or a helper call whose arguments
//! are any of those (parenthesized calls nest):
//!
//! ```text
//! {{trimSuffix .Name "-release"}}/{{.Name}}-{{.Version}}-{{.StemcellOS}}-{{.StemcellVersion}}.tgz
//! ```
//!
//! Templates are parsed once when the source is constructed, so syntax
//! errors surface as configuration errors before any request is made.

use kiln_schema::ComponentSpec;
use thiserror::Error;

/// Template parse and evaluation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template text is malformed.
    #[error("invalid path_template {template:?}: {reason}")]
    Parse {
        /// Raw template text.
        template: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The template uses a field the requirement does not carry.
    #[error("path_template references .{field} but release {release:?} has no {field} (built releases have no stemcell)")]
    MissingField {
        /// Template field name.
        field: &'static str,
        /// Release being resolved.
        release: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Version,
    StemcellOs,
    StemcellVersion,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Name" => Some(Self::Name),
            "Version" => Some(Self::Version),
            "StemcellOS" => Some(Self::StemcellOs),
            "StemcellVersion" => Some(Self::StemcellVersion),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::Version => "Version",
            Self::StemcellOs => "StemcellOS",
            Self::StemcellVersion => "StemcellVersion",
        }
    }

    fn resolve(self, spec: &ComponentSpec) -> Result<String, TemplateError> {
        let value = match self {
            Self::Name => Some(&spec.name),
            Self::Version => Some(&spec.version),
            Self::StemcellOs => spec.stemcell_os.as_ref(),
            Self::StemcellVersion => spec.stemcell_version.as_ref(),
        };
        value.cloned().ok_or_else(|| TemplateError::MissingField {
            field: self.label(),
            release: spec.name.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    TrimSuffix,
    TrimPrefix,
    ToLower,
    ToUpper,
}

impl Func {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "trimSuffix" => Some(Self::TrimSuffix),
            "trimPrefix" => Some(Self::TrimPrefix),
            "toLower" => Some(Self::ToLower),
            "toUpper" => Some(Self::ToUpper),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::TrimSuffix | Self::TrimPrefix => 2,
            Self::ToLower | Self::ToUpper => 1,
        }
    }

    fn apply(self, args: &[String]) -> String {
        match self {
            Self::TrimSuffix => args[0]
                .strip_suffix(args[1].as_str())
                .unwrap_or(&args[0])
                .to_string(),
            Self::TrimPrefix => args[0]
                .strip_prefix(args[1].as_str())
                .unwrap_or(&args[0])
                .to_string(),
            Self::ToLower => args[0].to_lowercase(),
            Self::ToUpper => args[0].to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Field(Field),
    Literal(String),
    Call(Func, Vec<Expr>),
}

impl Expr {
    fn eval(&self, spec: &ComponentSpec) -> Result<String, TemplateError> {
        match self {
            Self::Field(field) => field.resolve(spec),
            Self::Literal(text) => Ok(text.clone()),
            Self::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(spec))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(func.apply(&values))
            }
        }
    }

    fn uses_stemcell(&self) -> bool {
        match self {
            Self::Field(f) => matches!(f, Field::StemcellOs | Field::StemcellVersion),
            Self::Literal(_) => false,
            Self::Call(_, args) => args.iter().any(Self::uses_stemcell),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Action(Expr),
}

/// A parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse template text.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let fail = |reason: String| TemplateError::Parse {
            template: raw.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or_else(|| fail("unclosed action".to_string()))?;
            let tokens = tokenize(&after_open[..close]).map_err(&fail)?;
            let mut parser = Parser { tokens, pos: 0 };
            let expr = parser.expr().map_err(&fail)?;
            if parser.pos != parser.tokens.len() {
                return Err(fail(format!(
                    "unexpected {:?} in action",
                    parser.tokens[parser.pos]
                )));
            }
            segments.push(Segment::Action(expr));
            rest = &after_open[close + 2..];
        }
        if rest.contains("}}") {
            return Err(fail("unexpected \"}}\" outside an action".to_string()));
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Evaluate for one requirement.
    pub fn render(&self, spec: &ComponentSpec) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(expr) => out.push_str(&expr.eval(spec)?),
            }
        }
        Ok(out)
    }

    /// Whether the template needs stemcell fields (compiled releases only).
    pub fn uses_stemcell(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Action(e) if e.uses_stemcell()))
    }

    /// The literal text before the first action.
    pub fn literal_prefix(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Text(text)) => text,
            _ => "",
        }
    }

    /// Raw template text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(String),
    Str(String),
    Ident(String),
    Open,
    Close,
}

fn tokenize(action: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = action.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '|' => return Err("pipelines are not supported; call helpers directly".to_string()),
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err("unterminated string".to_string()),
                        },
                        Some(other) => text.push(other),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '.' => {
                chars.next();
                let name = take_word(&mut chars);
                if name.is_empty() {
                    return Err("expected a field name after \".\"".to_string());
                }
                tokens.push(Token::Field(name));
            }
            c if c.is_alphabetic() => tokens.push(Token::Ident(take_word(&mut chars))),
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Ident(_)) => self.call(),
            Some(_) => self.operand(),
            None => Err("empty action".to_string()),
        }
    }

    fn call(&mut self) -> Result<Expr, String> {
        let Some(Token::Ident(name)) = self.advance() else {
            return Err("expected a function name".to_string());
        };
        let func = Func::parse(&name).ok_or_else(|| format!("function {name:?} not defined"))?;

        let mut args = Vec::new();
        while matches!(
            self.peek(),
            Some(Token::Field(_) | Token::Str(_) | Token::Open)
        ) {
            args.push(self.operand()?);
        }
        if args.len() != func.arity() {
            return Err(format!(
                "{name} takes {} argument(s), got {}",
                func.arity(),
                args.len()
            ));
        }
        Ok(Expr::Call(func, args))
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Field(name)) => Field::parse(&name)
                .map(Expr::Field)
                .ok_or_else(|| format!("can't evaluate field {name}")),
            Some(Token::Str(text)) => Ok(Expr::Literal(text)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("unclosed \"(\"".to_string()),
                }
            }
            Some(Token::Ident(name)) => Err(format!("function {name:?} used as an argument without parentheses")),
            Some(Token::Close) => Err("unexpected \")\"".to_string()),
            None => Err("missing operand".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::Stemcell;

    fn compiled(name: &str, version: &str) -> ComponentSpec {
        ComponentSpec::new(name, version).with_stemcell(&Stemcell {
            os: "ubuntu-jammy".to_string(),
            version: "1.44".to_string(),
        })
    }

    #[test]
    fn renders_compiled_key() {
        let t = PathTemplate::parse(
            "{{.Name}}/{{.Name}}-{{.Version}}-{{.StemcellOS}}-{{.StemcellVersion}}.tgz",
        )
        .unwrap();
        assert_eq!(
            t.render(&compiled("bpm", "1.2.3")).unwrap(),
            "bpm/bpm-1.2.3-ubuntu-jammy-1.44.tgz"
        );
        assert!(t.uses_stemcell());
    }

    #[test]
    fn helpers_and_nesting() {
        let t = PathTemplate::parse(
            r#"2.11/{{trimSuffix .Name "-release"}}/{{toUpper (trimPrefix .Name "cf-")}}-{{.Version}}.tgz"#,
        )
        .unwrap();
        assert_eq!(
            t.render(&ComponentSpec::new("cf-routing-release", "0.1")).unwrap(),
            "2.11/cf-routing/ROUTING-RELEASE-0.1.tgz"
        );
        assert_eq!(t.literal_prefix(), "2.11/");
        assert!(!t.uses_stemcell());
    }

    #[test]
    fn built_spec_with_stemcell_template_names_the_field() {
        let t = PathTemplate::parse("{{.Name}}-{{.Version}}-{{.StemcellOS}}.tgz").unwrap();
        let err = t.render(&ComponentSpec::new("bpm", "1.2.3")).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingField {
                field: "StemcellOS",
                release: "bpm".to_string()
            }
        );
        assert!(err.to_string().contains("StemcellOS"));
    }

    #[test]
    fn rejects_malformed_templates() {
        for bad in [
            "{{.Name",
            "{{.Nmae}}",
            "{{trimSuffix .Name}}",
            "{{lower .Name}}",
            "{{.Name | trimSuffix \"x\"}}",
            "{{}}",
            "name}}",
        ] {
            assert!(
                matches!(PathTemplate::parse(bad), Err(TemplateError::Parse { .. })),
                "{bad} should not parse"
            );
        }
    }
}
