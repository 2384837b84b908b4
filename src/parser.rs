//! MemQL grammar.
//!
//! ```text
//! CREATE MEM (content="...", tags="a b", importance=0.7, source="...")
//! [SELECT] [VECTOR "text" [SCORE 0.6]] [WHERE field op literal] [ORDER BY field [DESC]] [LIMIT n]
//! UPDATE SET field=literal {, field=literal} [WHERE field op literal]
//! DELETE * | DELETE WHERE field op literal
//! ```
//!
//! `WHERE` takes exactly one comparison; there is no AND/OR. `VECTOR` and
//! `WHERE` cannot appear in the same statement. Conditions are resolved
//! into a `Predicate` here, once, so evaluation never looks at field names.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{cut, map, map_res, not, opt, value},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::error::{MemError, Result};
use crate::model::Record;

pub const DEFAULT_LIMIT: usize = 50;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Create(Vec<Assignment>),
    Select(SelectQuery),
    Update { assignments: Vec<Assignment>, filter: Option<Predicate> },
    Delete(DeleteTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub vector: Option<VectorClause>,
    pub filter: Option<Predicate>,
    pub order: Option<OrderBy>,
    /// 0 means no cap
    pub limit: usize,
}

impl Default for SelectQuery {
    fn default() -> Self {
        Self { vector: None, filter: None, order: None, limit: DEFAULT_LIMIT }
    }
}

impl SelectQuery {
    /// Every record, uncapped. Used to enumerate targets of mutations.
    pub fn all(filter: Option<Predicate>) -> Self {
        Self { filter, limit: 0, ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorClause {
    pub text: String,
    /// Candidates must score strictly above this
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    All,
    Where(Predicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Importance,
    CreatedAt,
    UpdatedAt,
    SimilarityScore,
    Id,
    Content,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub key: SortKey,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Content(String),
    Tags(Vec<String>),
    Importance(f32),
    Source(String),
    Encrypted(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    Importance,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Eq => left == right,
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
        }
    }
}

/// A resolved `WHERE` condition. Text needles are stored lowercased.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    TagContains(String),
    ContentContains(String),
    SourceContains(String),
    IdEquals(String),
    EncryptedEquals(bool),
    Compare { field: NumericField, op: Comparison, value: f64 },
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::TagContains(needle) => {
                record.tags().iter().any(|t| t.to_lowercase().contains(needle.as_str()))
            }
            Predicate::ContentContains(needle) => record.content.to_lowercase().contains(needle.as_str()),
            Predicate::SourceContains(needle) => record.source.to_lowercase().contains(needle.as_str()),
            Predicate::IdEquals(id) => record.id.to_lowercase() == *id,
            Predicate::EncryptedEquals(flag) => record.encrypted == *flag,
            Predicate::Compare { field, op, value } => {
                let actual = match field {
                    NumericField::Importance => f64::from(record.importance),
                    NumericField::CreatedAt => record.created_at,
                    NumericField::UpdatedAt => record.updated_at,
                };
                op.holds(actual, *value)
            }
        }
    }

    /// Whether the predicate reads fields that are sealed on encrypted
    /// records.
    pub fn needs_plaintext(&self) -> bool {
        matches!(
            self,
            Predicate::TagContains(_) | Predicate::ContentContains(_) | Predicate::SourceContains(_)
        )
    }
}

// --- RAW SYNTAX ---

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Quoted(String),
    Bare(String),
}

impl Literal {
    fn text(&self) -> &str {
        match self {
            Literal::Quoted(s) | Literal::Bare(s) => s,
        }
    }

    fn number(&self, field: &str) -> Result<f64> {
        self.text().trim().parse::<f64>().map_err(|_| {
            MemError::InvalidQuery(format!("{} expects a number, got '{}'", field, self.text()))
        })
    }

    fn boolean(&self, field: &str) -> Result<bool> {
        match self.text().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(MemError::InvalidQuery(format!("{} expects true or false, got '{}'", field, other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RawCondition {
    field: String,
    op: Comparison,
    literal: Literal,
}

#[derive(Debug, Clone, PartialEq)]
struct RawAssignment {
    field: String,
    literal: Literal,
}

#[derive(Debug, Clone, PartialEq)]
enum RawStatement {
    Create(Vec<RawAssignment>),
    Select {
        vector: Option<(String, Option<f64>)>,
        condition: Option<RawCondition>,
        order: Option<(String, bool)>,
        limit: Option<usize>,
    },
    Update { assignments: Vec<RawAssignment>, condition: Option<RawCondition> },
    Delete(Option<RawCondition>),
}

// --- BASIC PARSERS ---

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

/// Case-insensitive keyword that must not run into a following word.
fn keyword(k: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| terminated(tag_no_case(k), not(satisfy(is_word_char)))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(is_word_char)(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            delimited(char('\''), take_until("'"), char('\'')),
        )),
        str::to_string,
    )(input)
}

fn bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, '(' | ')' | ',' | '"' | '\''))(input)
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(quoted, Literal::Quoted),
        map(bare, |s: &str| Literal::Bare(s.to_string())),
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Comparison> {
    alt((
        value(Comparison::Ge, tag(">=")),
        value(Comparison::Le, tag("<=")),
        value(Comparison::Gt, tag(">")),
        value(Comparison::Lt, tag("<")),
        value(Comparison::Eq, tag("=")),
    ))(input)
}

// --- CLAUSE PARSERS ---

fn condition(input: &str) -> IResult<&str, RawCondition> {
    map(
        tuple((ws(identifier), ws(comparison), ws(literal))),
        |(field, op, literal)| RawCondition { field: field.to_string(), op, literal },
    )(input)
}

fn where_clause(input: &str) -> IResult<&str, RawCondition> {
    preceded(ws(keyword("WHERE")), cut(condition))(input)
}

fn vector_clause(input: &str) -> IResult<&str, (String, Option<f64>)> {
    preceded(
        ws(keyword("VECTOR")),
        cut(pair(ws(quoted), opt(preceded(ws(keyword("SCORE")), cut(ws(double)))))),
    )(input)
}

fn order_by(input: &str) -> IResult<&str, (&str, bool)> {
    preceded(
        pair(ws(keyword("ORDER")), ws(keyword("BY"))),
        cut(pair(
            ws(identifier),
            map(opt(ws(alt((keyword("DESC"), keyword("ASC"))))), |d: Option<&str>| {
                d.map_or(false, |d| d.eq_ignore_ascii_case("DESC"))
            }),
        )),
    )(input)
}

fn limit_clause(input: &str) -> IResult<&str, usize> {
    preceded(ws(keyword("LIMIT")), cut(ws(map_res(digit1, |s: &str| s.parse::<usize>()))))(input)
}

fn assignment(input: &str) -> IResult<&str, RawAssignment> {
    map(
        tuple((ws(identifier), ws(char('=')), ws(literal))),
        |(field, _, literal)| RawAssignment { field: field.to_string(), literal },
    )(input)
}

fn assignments(input: &str) -> IResult<&str, Vec<RawAssignment>> {
    separated_list1(ws(char(',')), assignment)(input)
}

// --- STATEMENT PARSERS ---

fn parse_create(input: &str) -> IResult<&str, RawStatement> {
    let (input, _) = ws(keyword("CREATE"))(input)?;
    let (input, list) = cut(preceded(
        ws(keyword("MEM")),
        delimited(ws(char('(')), assignments, ws(char(')'))),
    ))(input)?;
    Ok((input, RawStatement::Create(list)))
}

fn parse_update(input: &str) -> IResult<&str, RawStatement> {
    let (input, _) = ws(keyword("UPDATE"))(input)?;
    let (input, (list, condition)) =
        cut(preceded(ws(keyword("SET")), pair(assignments, opt(where_clause))))(input)?;
    Ok((input, RawStatement::Update { assignments: list, condition }))
}

fn parse_delete(input: &str) -> IResult<&str, RawStatement> {
    let (input, _) = ws(keyword("DELETE"))(input)?;
    let (input, target) = cut(alt((value(None, ws(char('*'))), map(where_clause, Some))))(input)?;
    Ok((input, RawStatement::Delete(target)))
}

fn parse_select(input: &str) -> IResult<&str, RawStatement> {
    let (input, _) = opt(ws(keyword("SELECT")))(input)?;
    let (input, vector) = opt(vector_clause)(input)?;
    let (input, condition) = opt(where_clause)(input)?;
    let (input, order) = opt(order_by)(input)?;
    let (input, limit) = opt(limit_clause)(input)?;
    Ok((
        input,
        RawStatement::Select {
            vector,
            condition,
            order: order.map(|(field, desc)| (field.to_string(), desc)),
            limit,
        },
    ))
}

pub fn parse_statement(input: &str) -> Result<Statement> {
    let input = input.trim().trim_end_matches(';');
    let result = alt((parse_create, parse_update, parse_delete, parse_select))(input);

    match result {
        Ok((remainder, raw)) => {
            if !remainder.trim().is_empty() {
                return Err(MemError::InvalidQuery(format!(
                    "Unexpected tokens at end: '{}'",
                    remainder.trim()
                )));
            }
            raw.resolve()
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            let ellipsis = if e.input.chars().count() > 20 { "..." } else { "" };
            Err(MemError::InvalidQuery(format!("Invalid syntax near: '{}{}'", context, ellipsis)))
        }
        Err(nom::Err::Incomplete(_)) => Err(MemError::InvalidQuery("Incomplete query".into())),
    }
}

// --- RESOLUTION ---

impl RawStatement {
    fn resolve(self) -> Result<Statement> {
        match self {
            RawStatement::Create(list) => {
                let assignments = list.into_iter().map(RawAssignment::resolve).collect::<Result<Vec<_>>>()?;
                Ok(Statement::Create(assignments))
            }
            RawStatement::Select { vector, condition, order, limit } => {
                if vector.is_some() && condition.is_some() {
                    return Err(MemError::InvalidQuery("VECTOR cannot be combined with WHERE".into()));
                }
                Ok(Statement::Select(SelectQuery {
                    vector: vector.map(|(text, score)| VectorClause {
                        text,
                        threshold: score.map_or(DEFAULT_SCORE_THRESHOLD, |s| s as f32),
                    }),
                    filter: condition.map(RawCondition::resolve).transpose()?,
                    order: order.map(|(field, descending)| resolve_sort_key(&field).map(|key| OrderBy { key, descending })).transpose()?,
                    limit: limit.unwrap_or(DEFAULT_LIMIT),
                }))
            }
            RawStatement::Update { assignments, condition } => {
                let assignments = assignments
                    .into_iter()
                    .map(RawAssignment::resolve)
                    .collect::<Result<Vec<_>>>()?;
                if assignments.iter().any(|a| matches!(a, Assignment::Encrypted(_))) {
                    return Err(MemError::InvalidQuery("encrypted cannot be changed by UPDATE".into()));
                }
                Ok(Statement::Update {
                    assignments,
                    filter: condition.map(RawCondition::resolve).transpose()?,
                })
            }
            RawStatement::Delete(None) => Ok(Statement::Delete(DeleteTarget::All)),
            RawStatement::Delete(Some(condition)) => Ok(Statement::Delete(DeleteTarget::Where(condition.resolve()?))),
        }
    }
}

impl RawCondition {
    fn resolve(self) -> Result<Predicate> {
        let field = self.field.to_ascii_lowercase();
        let equality_only = |predicate: Predicate| {
            if self.op == Comparison::Eq {
                Ok(predicate)
            } else {
                Err(MemError::InvalidQuery(format!("{} only supports '='", field)))
            }
        };

        match field.as_str() {
            "tags" => equality_only(Predicate::TagContains(self.literal.text().to_lowercase())),
            "content" => equality_only(Predicate::ContentContains(self.literal.text().to_lowercase())),
            "source" => equality_only(Predicate::SourceContains(self.literal.text().to_lowercase())),
            "id" => equality_only(Predicate::IdEquals(self.literal.text().to_lowercase())),
            "encrypted" => equality_only(Predicate::EncryptedEquals(self.literal.boolean(&field)?)),
            "importance" => Ok(Predicate::Compare {
                field: NumericField::Importance,
                op: self.op,
                // Compare in the precision importance is stored with.
                value: f64::from(self.literal.number(&field)? as f32),
            }),
            "created_at" => Ok(Predicate::Compare {
                field: NumericField::CreatedAt,
                op: self.op,
                value: self.literal.number(&field)?,
            }),
            "updated_at" => Ok(Predicate::Compare {
                field: NumericField::UpdatedAt,
                op: self.op,
                value: self.literal.number(&field)?,
            }),
            other => Err(MemError::InvalidQuery(format!("unknown field '{}'", other))),
        }
    }
}

impl RawAssignment {
    fn resolve(self) -> Result<Assignment> {
        let field = self.field.to_ascii_lowercase();
        match field.as_str() {
            "content" => Ok(Assignment::Content(self.literal.text().to_string())),
            "tags" => Ok(Assignment::Tags(
                self.literal
                    .text()
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            "importance" => Ok(Assignment::Importance(self.literal.number(&field)? as f32)),
            "source" => Ok(Assignment::Source(self.literal.text().to_string())),
            "encrypted" => Ok(Assignment::Encrypted(self.literal.boolean(&field)?)),
            "id" => Err(MemError::InvalidQuery("id is immutable".into())),
            other => Err(MemError::InvalidQuery(format!("cannot assign field '{}'", other))),
        }
    }
}

fn resolve_sort_key(field: &str) -> Result<SortKey> {
    match field.to_ascii_lowercase().as_str() {
        "importance" => Ok(SortKey::Importance),
        "created_at" => Ok(SortKey::CreatedAt),
        "updated_at" => Ok(SortKey::UpdatedAt),
        "similarity_score" => Ok(SortKey::SimilarityScore),
        "id" => Ok(SortKey::Id),
        "content" => Ok(SortKey::Content),
        "source" => Ok(SortKey::Source),
        other => Err(MemError::InvalidQuery(format!("cannot order by '{}'", other))),
    }
}
