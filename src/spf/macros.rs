//! Macro expansion for SPF domain-specs (RFC 7208 §7).

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacroError {
    #[error("unterminated macro in `{0}`")]
    Unterminated(String),
    #[error("invalid macro letter `{0}`")]
    UnknownLetter(char),
    #[error("macro `{0}` only allowed in explanation text")]
    ExpOnly(char),
    #[error("invalid transformer `{0}`")]
    Transformer(String),
    #[error("invalid escape `%{0}`")]
    Escape(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Macro {
        letter: char,
        escape: bool,
        keep: Option<usize>,
        reverse: bool,
        delimiters: Vec<char>,
    },
}

/// Values available to macros while evaluating one `check_host`.
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    pub sender: &'a str,
    pub domain: &'a str,
    pub ip: IpAddr,
    pub helo: &'a str,
}

impl MacroContext<'_> {
    fn local_part(&self) -> &str {
        self.sender.rsplit_once('@').map_or("postmaster", |(l, _)| l)
    }

    fn sender_domain(&self) -> &str {
        self.sender.rsplit_once('@').map_or(self.domain, |(_, d)| d)
    }

    fn ip_labels(&self) -> String {
        match self.ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => v6
                .octets()
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f])
                .map(|n| format!("{n:x}"))
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    fn value(&self, letter: char) -> String {
        match letter {
            's' => self.sender.to_string(),
            'l' => self.local_part().to_string(),
            'o' => self.sender_domain().to_string(),
            'd' => self.domain.to_string(),
            'i' => self.ip_labels(),
            'v' => match self.ip {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            'h' => self.helo.to_string(),
            // No validated PTR name is tracked by the evaluator.
            _ => "unknown".to_string(),
        }
    }
}

fn tokenize(spec: &str) -> Result<Vec<Token>, MacroError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = spec.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some('_') => literal.push(' '),
            Some('-') => literal.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => body.push(c),
                        None => return Err(MacroError::Unterminated(spec.to_string())),
                    }
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(parse_macro(&body)?);
            }
            Some(other) => return Err(MacroError::Escape(other)),
            None => return Err(MacroError::Unterminated(spec.to_string())),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn parse_macro(body: &str) -> Result<Token, MacroError> {
    let mut chars = body.chars();
    let raw = chars.next().ok_or_else(|| MacroError::Transformer(body.to_string()))?;
    let letter = raw.to_ascii_lowercase();
    match letter {
        's' | 'l' | 'o' | 'd' | 'i' | 'p' | 'v' | 'h' => {}
        'c' | 'r' | 't' => return Err(MacroError::ExpOnly(raw)),
        _ => return Err(MacroError::UnknownLetter(raw)),
    }

    let rest = chars.as_str();
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let keep = match &rest[..digits_end] {
        "" => None,
        digits => match digits.parse::<usize>() {
            Ok(n) if n > 0 => Some(n.min(128)),
            _ => return Err(MacroError::Transformer(body.to_string())),
        },
    };

    let mut rest = &rest[digits_end..];
    let reverse = match rest.strip_prefix(['r', 'R']) {
        Some(after) => {
            rest = after;
            true
        }
        None => false,
    };

    let delimiters: Vec<char> = rest.chars().collect();
    if delimiters
        .iter()
        .any(|c| !matches!(c, '.' | '-' | '+' | ',' | '/' | '_' | '='))
    {
        return Err(MacroError::Transformer(body.to_string()));
    }

    Ok(Token::Macro {
        letter,
        escape: raw.is_ascii_uppercase(),
        keep,
        reverse,
        delimiters,
    })
}

/// Checks a domain-spec without expanding it.
pub fn validate(spec: &str) -> Result<(), MacroError> {
    tokenize(spec).map(|_| ())
}

pub fn expand(spec: &str, ctx: &MacroContext<'_>) -> Result<String, MacroError> {
    let mut out = String::with_capacity(spec.len());
    for token in tokenize(spec)? {
        match token {
            Token::Literal(s) => out.push_str(&s),
            Token::Macro {
                letter,
                escape,
                keep,
                reverse,
                delimiters,
            } => {
                let value = ctx.value(letter);
                let delimiters = if delimiters.is_empty() { vec!['.'] } else { delimiters };
                let mut parts: Vec<&str> = value.split(|c| delimiters.contains(&c)).collect();
                if reverse {
                    parts.reverse();
                }
                if let Some(n) = keep {
                    if parts.len() > n {
                        parts.drain(..parts.len() - n);
                    }
                }
                let joined = parts.join(".");
                if escape {
                    out.push_str(&url_escape(&joined));
                } else {
                    out.push_str(&joined);
                }
            }
        }
    }
    Ok(out)
}

fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
