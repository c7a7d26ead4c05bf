//! Filter AST.
//!
//! Conditions added one after another form a group: conditions on the same
//! path are OR'd, different paths AND'd. `or`/`and` combine whatever was
//! built so far with a new group strictly in call order, so
//! `a.or(b).filter(c)` is `(a OR b) AND c`, never `a OR (b AND c)`.

use std::fmt;

use basedb_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operator {
    Eq = 1,
    NotEq = 2,
    Gt = 3,
    Lt = 4,
    Ge = 5,
    Le = 6,
    /// Inclusive, value is `[low, high]`.
    Range = 7,
    /// Substring for strings, membership for references and lists.
    Has = 8,
    Exists = 9,
    NotExists = 10,
}

impl Operator {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Operator::Eq,
            2 => Operator::NotEq,
            3 => Operator::Gt,
            4 => Operator::Lt,
            5 => Operator::Ge,
            6 => Operator::Le,
            7 => Operator::Range,
            8 => Operator::Has,
            9 => Operator::Exists,
            10 => Operator::NotExists,
            _ => return None,
        })
    }

    /// Parse the textual form used on the command line and in logs.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" => Operator::Eq,
            "!=" => Operator::NotEq,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            ".." => Operator::Range,
            "has" => Operator::Has,
            "exists" => Operator::Exists,
            "!exists" => Operator::NotExists,
            _ => return None,
        })
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le | Operator::Range)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Range => "..",
            Operator::Has => "has",
            Operator::Exists => "exists",
            Operator::NotExists => "!exists",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted path; may cross a reference (`author.name`).
    pub path: String,
    pub op: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterTree {
    Group(Vec<Condition>),
    And(Box<FilterTree>, Box<FilterTree>),
    Or(Box<FilterTree>, Box<FilterTree>),
}

/// Filter under construction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    tree: Option<FilterTree>,
    /// Whether the trailing group still takes conditions.
    open: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, path: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        let cond = Condition {
            path: path.into(),
            op,
            value: value.into(),
        };
        self.tree = Some(match self.tree.take() {
            None => FilterTree::Group(vec![cond]),
            Some(tree) if self.open => push_trailing(tree, cond),
            Some(tree) => FilterTree::And(Box::new(tree), Box::new(FilterTree::Group(vec![cond]))),
        });
        self.open = true;
        self
    }

    pub fn or(self, build: impl FnOnce(Filter) -> Filter) -> Self {
        self.combine(build, |a, b| FilterTree::Or(Box::new(a), Box::new(b)))
    }

    pub fn and(self, build: impl FnOnce(Filter) -> Filter) -> Self {
        self.combine(build, |a, b| FilterTree::And(Box::new(a), Box::new(b)))
    }

    fn combine(
        mut self,
        build: impl FnOnce(Filter) -> Filter,
        join: impl FnOnce(FilterTree, FilterTree) -> FilterTree,
    ) -> Self {
        let Some(right) = build(Filter::new()).tree else {
            return self;
        };
        self.tree = Some(match self.tree.take() {
            None => right,
            Some(left) => join(left, right),
        });
        self.open = false;
        self
    }

    pub fn tree(&self) -> Option<&FilterTree> {
        self.tree.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_none()
    }
}

fn push_trailing(tree: FilterTree, cond: Condition) -> FilterTree {
    match tree {
        FilterTree::Group(mut conds) => {
            conds.push(cond);
            FilterTree::Group(conds)
        }
        FilterTree::And(l, r) => FilterTree::And(l, Box::new(push_trailing(*r, cond))),
        FilterTree::Or(l, r) => FilterTree::Or(l, Box::new(push_trailing(*r, cond))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(paths: &[&str]) -> FilterTree {
        FilterTree::Group(
            paths
                .iter()
                .map(|p| Condition {
                    path: p.to_string(),
                    op: Operator::Eq,
                    value: Value::Int(1),
                })
                .collect(),
        )
    }

    #[test]
    fn test_consecutive_filters_share_a_group() {
        let f = Filter::new()
            .filter("a", Operator::Eq, 1)
            .filter("b", Operator::Eq, 1);
        assert_eq!(f.tree(), Some(&group(&["a", "b"])));
    }

    #[test]
    fn test_call_order_is_kept() {
        let f = Filter::new()
            .filter("a", Operator::Eq, 1)
            .or(|f| f.filter("b", Operator::Eq, 1))
            .filter("c", Operator::Eq, 1);
        let expected = FilterTree::And(
            Box::new(FilterTree::Or(Box::new(group(&["a"])), Box::new(group(&["b"])))),
            Box::new(group(&["c"])),
        );
        assert_eq!(f.tree(), Some(&expected));
    }

    #[test]
    fn test_empty_or_is_ignored() {
        let f = Filter::new().filter("a", Operator::Eq, 1).or(|f| f);
        assert_eq!(f.tree(), Some(&group(&["a"])));
        assert!(Filter::new().and(|f| f).is_empty());
    }

    #[test]
    fn test_operator_text_forms() {
        for op in [Operator::Eq, Operator::Ge, Operator::Range, Operator::NotExists] {
            assert_eq!(Operator::parse(&op.to_string()), Some(op));
            assert_eq!(Operator::from_u8(op as u8), Some(op));
        }
        assert_eq!(Operator::parse("~"), None);
    }
}
