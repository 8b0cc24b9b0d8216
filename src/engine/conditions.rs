// Edge condition matching and the safe expression evaluator

//! # Conditions
//!
//! Two kinds of conditions are evaluated during execution:
//!
//! 1. **Edge conditions**: simple text predicates (`contains`, `equals`,
//!    `starts_with`, `ends_with`, `regex`) attached to edge config and
//!    matched against the stringified message content. See
//!    [`matches_condition`].
//! 2. **Conditional expressions**: a small boolean expression language
//!    used by CONDITIONAL nodes, e.g.
//!    `$input.score > 10 && $input.label == 'urgent'`. See
//!    [`evaluate_expression`].
//!
//! The expression language is evaluated by a hand-written recursive
//! descent interpreter over a fixed grammar. There is no host-language
//! eval anywhere: expressions can read the input message and nothing
//! else, so untrusted workflow definitions cannot reach the process.
//!
//! ## Grammar
//!
//! ```text
//! expr       := or
//! or         := and ( '||' and )*
//! and        := unary ( '&&' unary )*
//! unary      := '!' unary | comparison
//! comparison := primary ( ('=='|'!='|'<'|'<='|'>'|'>=') primary )?
//! primary    := literal | input | '(' expr ')'
//! literal    := string | number | 'true' | 'false' | 'null'
//! input      := '$input' ( '.' segment )*
//! ```

use regex::Regex;

use crate::{AgentFlowError, Result};

/// Match a text predicate against message content
///
/// `condition_type` selects the predicate; `condition_value` is its
/// operand. Unknown condition types fail closed.
pub fn matches_condition(condition_type: &str, condition_value: &str, text: &str) -> Result<bool> {
    match condition_type {
        "contains" => Ok(text.contains(condition_value)),
        "equals" => Ok(text == condition_value),
        "starts_with" => Ok(text.starts_with(condition_value)),
        "ends_with" => Ok(text.ends_with(condition_value)),
        "regex" => {
            let pattern = Regex::new(condition_value).map_err(|err| {
                AgentFlowError::Expression(format!("Invalid regex '{}': {}", condition_value, err))
            })?;
            Ok(pattern.is_match(text))
        }
        other => Err(AgentFlowError::Expression(format!(
            "Unknown condition type '{}'",
            other
        ))),
    }
}

/// Evaluate a boolean expression against the input message content
///
/// `input` is exposed to the expression as `$input`; dotted paths walk
/// into objects and arrays, and missing paths resolve to `null`.
pub fn evaluate_expression(expression: &str, input: &serde_json::Value) -> Result<bool> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        input,
    };
    let value = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(value.is_truthy())
}

/// Runtime value of an expression term
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Null => false,
        }
    }

    /// Numeric view, coercing numeric strings
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        if self == other {
            return true;
        }
        // Numeric strings compare equal to their numbers
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Null => Value::Null,
        // Containers compare and match as their JSON rendering
        other => Value::Str(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Or,
    And,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Input(Vec<String>),
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;

    let err = |msg: String| AgentFlowError::Expression(msg);

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(err("Expected '||'".to_string()));
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(err("Expected '&&'".to_string()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(err("Expected '=='".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            // Only quote and backslash escapes
                            match chars.get(i + 1) {
                                Some(&escaped) if escaped == quote || escaped == '\\' => {
                                    literal.push(escaped);
                                    i += 2;
                                }
                                _ => {
                                    literal.push('\\');
                                    i += 1;
                                }
                            }
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                        None => return Err(err("Unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '$' => {
                let mut ident = String::new();
                i += 1;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        ident.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                let mut segments = ident.split('.');
                match segments.next() {
                    Some("input") => {
                        let path: Vec<String> = segments.map(str::to_string).collect();
                        tokens.push(Token::Input(path));
                    }
                    _ => {
                        return Err(err(format!("Unknown variable '${}'", ident)));
                    }
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_digit() || ch == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let slice: String = chars[start..i].iter().collect();
                let number: f64 = slice
                    .parse()
                    .map_err(|_| err(format!("Invalid number '{}'", slice)))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while let Some(&ch) = chars.get(i) {
                    if ch.is_alphanumeric() || ch == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    other => {
                        return Err(err(format!("Unknown identifier '{}'", other)));
                    }
                }
            }
            other => {
                return Err(err(format!("Unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    input: &'a serde_json::Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect_end(&self) -> Result<()> {
        if self.position == self.tokens.len() {
            Ok(())
        } else {
            Err(AgentFlowError::Expression(
                "Unexpected trailing tokens".to_string(),
            ))
        }
    }

    fn parse_expr(&mut self) -> Result<Value> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(left.is_truthy() || right.is_truthy());
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Value::Bool(left.is_truthy() && right.is_truthy());
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Value::Bool(!operand.is_truthy()));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value> {
        let left = self.parse_primary()?;

        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;

        let result = match op {
            Token::Eq => left.loose_eq(&right),
            Token::Ne => !left.loose_eq(&right),
            ordering => {
                let (a, b) = Self::comparable_pair(&left, &right)?;
                match ordering {
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    /// Numeric views of both operands, required for ordering comparisons
    fn comparable_pair(left: &Value, right: &Value) -> Result<(f64, f64)> {
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(AgentFlowError::Expression(format!(
                "Cannot order {:?} against {:?}",
                left, right
            ))),
        }
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Input(path)) => Ok(self.resolve_input(&path)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(AgentFlowError::Expression("Expected ')'".to_string())),
                }
            }
            other => Err(AgentFlowError::Expression(format!(
                "Unexpected token {:?}",
                other
            ))),
        }
    }

    fn resolve_input(&self, path: &[String]) -> Value {
        let mut current = self.input;
        for segment in path {
            current = match current {
                serde_json::Value::Object(map) => match map.get(segment) {
                    Some(value) => value,
                    None => return Value::Null,
                },
                serde_json::Value::Array(items) => match segment.parse::<usize>() {
                    Ok(index) => match items.get(index) {
                        Some(value) => value,
                        None => return Value::Null,
                    },
                    Err(_) => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        json_to_value(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_predicates() {
        assert!(matches_condition("contains", "err", "an error occurred").unwrap());
        assert!(!matches_condition("contains", "xyz", "an error occurred").unwrap());
        assert!(matches_condition("equals", "yes", "yes").unwrap());
        assert!(matches_condition("starts_with", "Re:", "Re: hello").unwrap());
        assert!(matches_condition("ends_with", "!", "stop!").unwrap());
        assert!(matches_condition("regex", r"\d{3}", "code 404 seen").unwrap());
    }

    #[test]
    fn test_invalid_regex_and_unknown_type_error() {
        assert!(matches_condition("regex", "(", "text").is_err());
        assert!(matches_condition("fuzzy", "x", "text").is_err());
    }

    #[test]
    fn test_literal_expressions() {
        let input = json!(null);
        assert!(evaluate_expression("true", &input).unwrap());
        assert!(!evaluate_expression("false", &input).unwrap());
        assert!(evaluate_expression("1 < 2", &input).unwrap());
        assert!(evaluate_expression("'a' == 'a'", &input).unwrap());
        assert!(evaluate_expression("'a' != 'b'", &input).unwrap());
        assert!(!evaluate_expression("null", &input).unwrap());
    }

    #[test]
    fn test_input_path_lookup() {
        let input = json!({"score": 42, "label": "urgent", "tags": ["a", "b"]});
        assert!(evaluate_expression("$input.score > 10", &input).unwrap());
        assert!(evaluate_expression("$input.label == 'urgent'", &input).unwrap());
        assert!(evaluate_expression("$input.tags.1 == 'b'", &input).unwrap());
        // Missing paths resolve to null, which is falsy
        assert!(!evaluate_expression("$input.missing", &input).unwrap());
        assert!(evaluate_expression("$input.missing == null", &input).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let input = json!({"a": 1, "b": 0});
        assert!(evaluate_expression("$input.a == 1 && !$input.b", &input).unwrap());
        assert!(evaluate_expression("$input.b || $input.a", &input).unwrap());
        // && binds tighter than ||
        assert!(evaluate_expression("true || false && false", &input).unwrap());
        assert!(!evaluate_expression("(true || false) && false", &input).unwrap());
    }

    #[test]
    fn test_numeric_string_coercion() {
        let input = json!({"count": "5"});
        assert!(evaluate_expression("$input.count == 5", &input).unwrap());
        assert!(evaluate_expression("$input.count >= 4", &input).unwrap());
    }

    #[test]
    fn test_whole_input_truthiness() {
        assert!(evaluate_expression("$input", &json!("hello")).unwrap());
        assert!(!evaluate_expression("$input", &json!("")).unwrap());
        assert!(evaluate_expression("$input == 'hello'", &json!("hello")).unwrap());
    }

    #[test]
    fn test_malformed_expressions_error() {
        let input = json!(null);
        assert!(evaluate_expression("1 +", &input).is_err());
        assert!(evaluate_expression("$unknown", &input).is_err());
        assert!(evaluate_expression("(true", &input).is_err());
        assert!(evaluate_expression("true extra", &input).is_err());
        assert!(evaluate_expression("'a' < 'b' trailing", &input).is_err());
        assert!(evaluate_expression("'a' < 'b'", &input).is_err()); // non-numeric ordering
    }
}
