//! WQL subset used by `exec_query`.
//!
//! ```text
//! SELECT * | prop[, prop...] FROM Class [WHERE cond]
//! cond    := and ( OR and )*
//! and     := primary ( AND primary )*
//! primary := NOT primary | '(' cond ')' | prop op literal
//! op      := = | <> | != | < | <= | > | >=
//! literal := 'string' | "string" | integer | TRUE | FALSE
//! ```

use std::cmp::Ordering;

use crate::error::{ProviderError, Result};
use crate::types::{Instance, PropertyFilter, Value};

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// `None` for `SELECT *`.
    pub projection: Option<Vec<String>>,
    pub class_name: String,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        property: String,
        op: CompareOp,
        literal: Literal,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Bool(bool),
}

impl Query {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let query = parser.query()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing input at token {}",
                parser.pos
            )));
        }
        Ok(query)
    }

    /// Whether the instance satisfies the WHERE clause.
    pub fn matches(&self, instance: &Instance) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |cond| cond.evaluate(instance))
    }

    /// Property filter for the selected columns.
    pub fn filter(&self) -> PropertyFilter {
        match &self.projection {
            None => PropertyFilter::all(),
            Some(props) => PropertyFilter::only(props),
        }
    }
}

impl Condition {
    pub fn evaluate(&self, instance: &Instance) -> bool {
        match self {
            Condition::And(a, b) => a.evaluate(instance) && b.evaluate(instance),
            Condition::Or(a, b) => a.evaluate(instance) || b.evaluate(instance),
            Condition::Not(inner) => !inner.evaluate(instance),
            Condition::Compare {
                property,
                op,
                literal,
            } => match instance.get(property) {
                Some(value) => compare(value, literal).map_or(false, |ord| op.holds(ord)),
                None => false,
            },
        }
    }
}

impl CompareOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Order a property value against a literal; `None` when the types don't compare.
fn compare(value: &Value, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (Value::String(s), Literal::String(l)) => Some(s.as_str().cmp(l.as_str())),
        (Value::Bool(b), Literal::Bool(l)) => Some(b.cmp(l)),
        (v, Literal::Integer(l)) => {
            let n = v.as_u64()?;
            Some(i128::from(n).cmp(&i128::from(*l)))
        }
        _ => None,
    }
}

fn invalid(message: String) -> ProviderError {
    ProviderError::InvalidParameter(format!("query: {}", message))
}

// =============================================================================
// TOKENIZER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Star,
    Comma,
    LParen,
    RParen,
    Op(CompareOp),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Op(CompareOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|p| start + p)
                    .ok_or_else(|| invalid("unterminated string literal".to_string()))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<i64>()
                    .map_err(|e| invalid(format!("bad integer '{}': {}", text, e)))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

// =============================================================================
// PARSER
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Result<()> {
        if self.at_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid(format!("expected {}", keyword)))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(word),
            other => Err(invalid(format!("expected identifier, found {:?}", other))),
        }
    }

    fn query(&mut self) -> Result<Query> {
        self.keyword("SELECT")?;

        let projection = if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            None
        } else {
            let mut props = vec![self.ident()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                props.push(self.ident()?);
            }
            Some(props)
        };

        self.keyword("FROM")?;
        let class_name = self.ident()?;

        let condition = if self.at_keyword("WHERE") {
            self.pos += 1;
            Some(self.or_condition()?)
        } else {
            None
        };

        Ok(Query {
            projection,
            class_name,
            condition,
        })
    }

    fn or_condition(&mut self) -> Result<Condition> {
        let mut left = self.and_condition()?;
        while self.at_keyword("OR") {
            self.pos += 1;
            let right = self.and_condition()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_condition(&mut self) -> Result<Condition> {
        let mut left = self.primary()?;
        while self.at_keyword("AND") {
            self.pos += 1;
            let right = self.primary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Condition> {
        if self.at_keyword("NOT") {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.primary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_condition()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(invalid("expected ')'".to_string())),
            };
        }

        let property = self.ident()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => return Err(invalid(format!("expected operator, found {:?}", other))),
        };
        let literal = match self.next() {
            Some(Token::Str(s)) => Literal::String(s),
            Some(Token::Int(n)) => Literal::Integer(n),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Literal::Bool(true),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => Literal::Bool(false),
            other => return Err(invalid(format!("expected literal, found {:?}", other))),
        };

        Ok(Condition::Compare {
            property,
            op,
            literal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, state: u16) -> Instance {
        let mut inst = Instance::new("root/cimv2", "Xen_ComputerSystem");
        inst.set("Name", name);
        inst.set("EnabledState", state);
        inst.set("Caption", "Virtual Machine");
        inst
    }

    #[test]
    fn test_select_star() {
        let q = Query::parse("SELECT * FROM Xen_ComputerSystem").unwrap();
        assert_eq!(q.class_name, "Xen_ComputerSystem");
        assert!(q.projection.is_none());
        assert!(q.matches(&vm("a", 2)));
    }

    #[test]
    fn test_projection_and_where() {
        let q = Query::parse(
            "select Name, EnabledState from Xen_ComputerSystem where EnabledState = 2 and Name <> 'b'",
        )
        .unwrap();
        assert_eq!(
            q.projection,
            Some(vec!["Name".to_string(), "EnabledState".to_string()])
        );
        assert!(q.matches(&vm("a", 2)));
        assert!(!q.matches(&vm("b", 2)));
        assert!(!q.matches(&vm("a", 3)));
        assert!(!q.filter().admits("Caption"));
    }

    #[test]
    fn test_precedence_and_grouping() {
        // AND binds tighter than OR
        let q = Query::parse("SELECT * FROM C WHERE Name = 'x' OR Name = 'a' AND EnabledState >= 3").unwrap();
        assert!(q.matches(&vm("x", 2)));
        assert!(!q.matches(&vm("a", 2)));
        assert!(q.matches(&vm("a", 3)));

        let q = Query::parse("SELECT * FROM C WHERE NOT (Name = 'x' OR Name = 'y')").unwrap();
        assert!(q.matches(&vm("a", 2)));
        assert!(!q.matches(&vm("y", 2)));
    }

    #[test]
    fn test_missing_property_does_not_match() {
        let q = Query::parse("SELECT * FROM C WHERE Owner = 'ops'").unwrap();
        assert!(!q.matches(&vm("a", 2)));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "SELECT FROM C",
            "SELECT * C",
            "SELECT * FROM C WHERE",
            "SELECT * FROM C WHERE Name = 'open",
            "SELECT * FROM C WHERE (Name = 'a'",
            "SELECT * FROM C extra",
            "SELECT * FROM C WHERE Name ~ 'a'",
        ] {
            assert!(
                matches!(Query::parse(bad), Err(ProviderError::InvalidParameter(_))),
                "{bad:?} should not parse"
            );
        }
    }
}
