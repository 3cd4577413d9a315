//! Boolean condition trees used for `WHERE` filters and `IF` guards.
//!
//! A condition is evaluated against a candidate row that may be absent.
//! Logical nodes short-circuit left to right, and comparing values from
//! different type families is an error instead of a non-match.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::row::StoredRow;
use crate::schema::{ColumnSchema, Schema};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Equal => "=",
            CompareOp::NotEqual => "<>",
            CompareOp::Less => "<",
            CompareOp::LessEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEqual => ">=",
        }
    }

    fn matches(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Equal => ord == Ordering::Equal,
            CompareOp::NotEqual => ord != Ordering::Equal,
            CompareOp::Less => ord == Ordering::Less,
            CompareOp::LessEqual => ord != Ordering::Greater,
            CompareOp::Greater => ord == Ordering::Greater,
            CompareOp::GreaterEqual => ord != Ordering::Less,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// One node of a condition tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Comparison {
        column: String,
        op: CompareOp,
        value: Value,
    },
    Exists,
    NotExists,
    Logical {
        op: LogicalOp,
        operands: Vec<Condition>,
    },
}

impl Condition {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Comparison {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Equal, value)
    }

    pub fn and(operands: Vec<Condition>) -> Self {
        Condition::Logical {
            op: LogicalOp::And,
            operands,
        }
    }

    pub fn or(operands: Vec<Condition>) -> Self {
        Condition::Logical {
            op: LogicalOp::Or,
            operands,
        }
    }

    /// Append an operand.
    ///
    /// On a leaf node this turns the node into `AND(self, operand)`.
    pub fn add_operand(&mut self, operand: Condition) -> &mut Self {
        match self {
            Condition::Logical { operands, .. } => operands.push(operand),
            _ => {
                let first = std::mem::replace(self, Condition::Exists);
                *self = Condition::and(vec![first, operand]);
            }
        }
        self
    }

    pub fn add_comparison(
        &mut self,
        column: impl Into<String>,
        op: CompareOp,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.add_operand(Condition::compare(column, op, value))
    }

    /// Remove and return the last operand of a logical node.
    pub fn remove_last_operand(&mut self) -> Option<Condition> {
        match self {
            Condition::Logical { operands, .. } => operands.pop(),
            _ => None,
        }
    }

    /// Replace the operand at `index`, returning the previous one.
    pub fn replace_operand(&mut self, index: usize, operand: Condition) -> Option<Condition> {
        match self {
            Condition::Logical { operands, .. } => operands
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, operand)),
            _ => None,
        }
    }

    pub fn operands(&self) -> &[Condition] {
        match self {
            Condition::Logical { operands, .. } => operands,
            _ => &[],
        }
    }

    /// Check every comparison against the schema without looking at data.
    pub fn validate(&self, schema: &Schema) -> Result<(), EvalError> {
        match self {
            Condition::Comparison { column, value, .. } => {
                resolve_comparison(schema, column, value).map(|_| ())
            }
            Condition::Exists | Condition::NotExists => Ok(()),
            Condition::Logical { operands, .. } => {
                if operands.is_empty() {
                    return Err(EvalError::EmptyLogical);
                }
                operands.iter().try_for_each(|c| c.validate(schema))
            }
        }
    }

    /// Evaluate against `row`, where `None` means the row does not exist.
    pub fn evaluate(&self, schema: &Schema, row: Option<&StoredRow>) -> Result<bool, EvalError> {
        match self {
            Condition::Exists => Ok(row.is_some()),
            Condition::NotExists => Ok(row.is_none()),
            Condition::Comparison { column, op, value } => {
                let col = resolve_comparison(schema, column, value)?;
                let Some(row) = row else {
                    return Ok(false);
                };
                compare_cell(row.get(col.id), *op, value)
            }
            Condition::Logical { op, operands } => {
                if operands.is_empty() {
                    return Err(EvalError::EmptyLogical);
                }
                match op {
                    LogicalOp::And => {
                        for operand in operands {
                            if !operand.evaluate(schema, row)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    LogicalOp::Or => {
                        for operand in operands {
                            if operand.evaluate(schema, row)? {
                                return Ok(true);
                            }
                        }
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Top-level conjuncts: the flattened operands of nested ANDs, or the
    /// node itself.
    pub fn conjuncts(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        collect_conjuncts(self, &mut out);
        out
    }
}

fn collect_conjuncts<'a>(cond: &'a Condition, out: &mut Vec<&'a Condition>) {
    match cond {
        Condition::Logical {
            op: LogicalOp::And,
            operands,
        } => {
            for operand in operands {
                collect_conjuncts(operand, out);
            }
        }
        other => out.push(other),
    }
}

fn resolve_comparison<'a>(
    schema: &'a Schema,
    column: &str,
    value: &Value,
) -> Result<&'a ColumnSchema, EvalError> {
    let col = schema
        .column(column)
        .ok_or_else(|| EvalError::UnknownColumn(column.to_string()))?;
    match value.family() {
        Some(family) if family != col.data_type.family() => Err(EvalError::ValuesNotComparable),
        _ => Ok(col),
    }
}

// No three-valued logic: a null on either side only satisfies the equality
// operators, and only when both sides are null (EQUAL) or exactly one is
// (NOT_EQUAL).
fn compare_cell(cell: &Value, op: CompareOp, literal: &Value) -> Result<bool, EvalError> {
    match (cell.is_null(), literal.is_null()) {
        (false, false) => Ok(op.matches(cell.compare(literal)?)),
        (true, true) => Ok(op == CompareOp::Equal),
        _ => Ok(op == CompareOp::NotEqual),
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Comparison { column, op, value } => {
                write!(f, "{column} {} {value}", op.symbol())
            }
            Condition::Exists => f.write_str("EXISTS"),
            Condition::NotExists => f.write_str("NOT EXISTS"),
            Condition::Logical { op, operands } => {
                let sep = match op {
                    LogicalOp::And => " AND ",
                    LogicalOp::Or => " OR ",
                };
                f.write_str("(")?;
                for (idx, operand) in operands.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{operand}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn schema() -> Schema {
        Schema::builder()
            .hash_column("h1", DataType::Int32)
            .range_column("r1", DataType::Int32)
            .range_column("r2", DataType::String)
            .column("c1", DataType::Int32)
            .column("c2", DataType::String)
            .build()
            .expect("schema")
    }

    fn row(schema: &Schema, r1: i32, r2: &str, c1: Option<i32>) -> StoredRow {
        let mut row = StoredRow::default();
        row.set(schema.column("h1").expect("h1").id, Value::Int32(1));
        row.set(schema.column("r1").expect("r1").id, Value::Int32(r1));
        row.set(schema.column("r2").expect("r2").id, Value::from(r2));
        row.set(schema.column("c1").expect("c1").id, Value::from(c1));
        row
    }

    #[test]
    fn nested_and_or_matches_only_listed_rows() {
        let schema = schema();
        let cond = Condition::and(vec![
            Condition::eq("r1", 2),
            Condition::or(vec![Condition::eq("r2", "b"), Condition::eq("r2", "d")]),
        ]);
        let hits = [("b", true), ("c", false), ("d", true)];
        for (r2, expected) in hits {
            let row = row(&schema, 2, r2, Some(3));
            assert_eq!(
                cond.evaluate(&schema, Some(&row)).expect("evaluate"),
                expected,
                "r2={r2}"
            );
        }
        let other = row(&schema, 3, "b", Some(3));
        assert!(!cond.evaluate(&schema, Some(&other)).expect("evaluate"));
    }

    #[test]
    fn null_cell_equality_is_false_and_inequality_is_true() {
        let schema = schema();
        let row = row(&schema, 2, "b", None);
        assert!(!Condition::eq("c1", 3)
            .evaluate(&schema, Some(&row))
            .expect("eq"));
        assert!(Condition::compare("c1", CompareOp::NotEqual, 3)
            .evaluate(&schema, Some(&row))
            .expect("ne"));
        assert!(!Condition::compare("c1", CompareOp::Less, 3)
            .evaluate(&schema, Some(&row))
            .expect("lt"));
    }

    #[test]
    fn exists_and_comparisons_over_absent_row() {
        let schema = schema();
        assert!(!Condition::Exists.evaluate(&schema, None).expect("exists"));
        assert!(Condition::NotExists.evaluate(&schema, None).expect("not exists"));
        assert!(!Condition::eq("c1", 3).evaluate(&schema, None).expect("eq"));
        let guard = Condition::or(vec![Condition::NotExists, Condition::eq("c2", "d")]);
        assert!(guard.evaluate(&schema, None).expect("or"));
    }

    #[test]
    fn mismatched_family_is_an_error_even_for_absent_rows() {
        let schema = schema();
        let cond = Condition::compare("r1", CompareOp::NotEqual, "2");
        let err = cond.evaluate(&schema, None).expect_err("must fail");
        assert_eq!(err, EvalError::ValuesNotComparable);
        assert_eq!(cond.validate(&schema), Err(EvalError::ValuesNotComparable));
    }

    #[test]
    fn short_circuit_hides_later_errors() {
        let schema = schema();
        let row = row(&schema, 2, "b", Some(3));
        let and = Condition::and(vec![Condition::eq("r1", 5), Condition::eq("r1", "x")]);
        assert!(!and.evaluate(&schema, Some(&row)).expect("and short-circuits"));
        let or = Condition::or(vec![Condition::eq("r1", 2), Condition::eq("r1", "x")]);
        assert!(or.evaluate(&schema, Some(&row)).expect("or short-circuits"));
        let or = Condition::or(vec![Condition::eq("r1", "x"), Condition::eq("r1", 2)]);
        assert!(or.evaluate(&schema, Some(&row)).is_err());
    }

    #[test]
    fn operands_can_be_edited_in_place() {
        let mut cond = Condition::eq("r1", 2);
        cond.add_comparison("r2", CompareOp::Equal, "b");
        assert_eq!(cond.operands().len(), 2);
        let removed = cond.remove_last_operand().expect("removed");
        assert_eq!(removed, Condition::eq("r2", "b"));
        cond.add_operand(Condition::eq("r2", "d"));
        let old = cond
            .replace_operand(0, Condition::eq("r1", 3))
            .expect("replaced");
        assert_eq!(old, Condition::eq("r1", 2));
        assert_eq!(cond.to_string(), "(r1 = 3 AND r2 = 'd')");
        assert!(Condition::and(Vec::new()).validate(&schema()).is_err());
    }
}
