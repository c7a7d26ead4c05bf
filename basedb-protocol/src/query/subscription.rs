//! Subscription headers: which fields of which types a live query reads,
//! so a backend change only re-runs queries it can affect.

use std::collections::BTreeMap;

use basedb_core::{ChangeSet, TypeDefs};

use super::plan::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interest {
    pub props: Vec<u8>,
    /// `(start, len)` main ranges.
    pub main: Vec<(u16, u16)>,
    pub all_main: bool,
}

impl Interest {
    fn add_field(&mut self, f: &FieldRef) {
        if f.is_id() {
            return;
        }
        if f.is_main() {
            self.main.push((f.start, f.len));
        } else if !self.props.contains(&f.prop) {
            self.props.push(f.prop);
        }
    }

    fn add_main(&mut self, main: &MainSelect) {
        match main {
            MainSelect::None => {}
            MainSelect::All => self.all_main = true,
            MainSelect::Slices(slices) => self.main.extend(slices.iter().copied()),
        }
    }

    fn add_prop(&mut self, prop: u8) {
        if !self.props.contains(&prop) {
            self.props.push(prop);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubHeader {
    pub type_id: u16,
    /// Per type id, including types reached through references and edges.
    pub interests: BTreeMap<u16, Interest>,
}

impl SubHeader {
    pub fn from_plan(plan: &QueryPlan, defs: &TypeDefs) -> Self {
        let mut header = SubHeader {
            type_id: plan.type_id,
            interests: BTreeMap::new(),
        };
        header.collect(plan, defs);
        header
    }

    fn collect(&mut self, plan: &QueryPlan, defs: &TypeDefs) {
        let interest = self.interests.entry(plan.type_id).or_default();
        interest.add_main(&plan.main);
        for p in plan.fields.iter().chain(&plan.meta) {
            interest.add_prop(*p);
        }
        if let Some(sort) = &plan.sort {
            interest.add_field(&sort.field);
        }
        match &plan.search {
            Some(SearchPlan::Lexical { fields, .. }) => fields.iter().for_each(|(f, _)| interest.add_field(f)),
            Some(SearchPlan::Vector { field, .. }) => interest.add_field(field),
            None => {}
        }
        if let Some(agg) = &plan.agg {
            if let Some((f, _)) = &agg.group_by {
                interest.add_field(f);
            }
            agg.fns.iter().for_each(|(_, f)| interest.add_field(f));
        }
        for r in &plan.refs {
            interest.add_prop(r.prop);
        }
        if let Some(filter) = &plan.filter {
            self.collect_filter(plan.type_id, filter, defs);
        }
        for r in &plan.refs {
            self.collect(&r.plan, defs);
            if let Some(edge) = &r.edge {
                let interest = self.interests.entry(edge.type_id).or_default();
                interest.add_main(&edge.main);
                edge.fields.iter().for_each(|p| interest.add_prop(*p));
            }
        }
    }

    fn collect_filter(&mut self, type_id: u16, filter: &FilterPlan, defs: &TypeDefs) {
        match filter {
            FilterPlan::Group(group) => {
                for entry in &group.entries {
                    match entry {
                        GroupEntry::Field { field, .. } => self.interests.entry(type_id).or_default().add_field(field),
                        GroupEntry::Ref { prop, filter } => {
                            self.interests.entry(type_id).or_default().add_prop(*prop);
                            let target = defs
                                .by_id(type_id)
                                .and_then(|t| t.by_prop_id(*prop))
                                .and_then(|p| p.reference.as_ref())
                                .map(|r| r.target_type_id);
                            if let Some(target) = target {
                                self.collect_filter(target, filter, defs);
                            }
                        }
                    }
                }
            }
            FilterPlan::And(a, b) | FilterPlan::Or(a, b) => {
                self.collect_filter(type_id, a, defs);
                self.collect_filter(type_id, b, defs);
            }
        }
    }

    /// Whether a batch described by `changes` may change this query's result.
    pub fn intersects(&self, changes: &ChangeSet) -> bool {
        // Creates and deletes change the result set of the root type.
        if changes.structural.contains(&self.type_id) {
            return true;
        }
        self.interests.iter().any(|(type_id, interest)| {
            let props_hit = changes
                .props
                .get(type_id)
                .is_some_and(|props| props.iter().any(|p| interest.props.contains(p)));
            let main_hit = changes.main.get(type_id).is_some_and(|ranges| {
                interest.all_main && !ranges.is_empty()
                    || ranges
                        .iter()
                        .any(|&(start, len)| interest.main.iter().any(|&(s, l)| overlaps(start, len, s, l)))
            });
            props_hit || main_hit
        })
    }
}

fn overlaps(a: u16, a_len: u16, b: u16, b_len: u16) -> bool {
    (a as u32) < b as u32 + b_len as u32 && (b as u32) < a as u32 + a_len as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{compile_query, Operator, Query};
    use basedb_core::config::SchemaConfig;
    use basedb_core::{compile, PropSchema as P, Schema, TypeSchema as T};

    fn defs() -> TypeDefs {
        let schema = Schema::new()
            .with_type(
                T::new("user")
                    .prop(P::string("name"))
                    .prop(P::uint32("flap"))
                    .prop(P::uint8("age")),
            )
            .with_type(T::new("team").prop(P::string("title")).prop(P::references("members", "user", "teams")));
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    fn changes(type_id: u16, props: Vec<u8>, main: Vec<(u16, u16)>) -> ChangeSet {
        let mut c = ChangeSet::default();
        c.props.insert(type_id, props);
        c.main.insert(type_id, main);
        c
    }

    #[test]
    fn test_main_overlap() {
        let defs = defs();
        let user = defs.get("user").unwrap();
        let flap = user.prop("flap").unwrap();
        let age = user.prop("age").unwrap();
        let sub = compile_query(Query::new("user").include(["flap"]).def(), &defs).unwrap().sub;

        assert!(sub.intersects(&changes(user.id, vec![], vec![(flap.start as u16, 4)])));
        assert!(!sub.intersects(&changes(user.id, vec![], vec![(age.start as u16, 1)])));
        assert!(!sub.intersects(&changes(user.id, vec![1], vec![])));
    }

    #[test]
    fn test_reference_targets_are_watched() {
        let defs = defs();
        let user = defs.get("user").unwrap();
        let name = user.prop("name").unwrap();
        let sub = compile_query(Query::new("team").include(["members.name"]).def(), &defs).unwrap().sub;
        assert!(sub.intersects(&changes(user.id, vec![name.prop], vec![])));

        let filtered = compile_query(
            Query::new("team").include(["title"]).filter("members.age", Operator::Gt, 3u8).def(),
            &defs,
        )
        .unwrap()
        .sub;
        let age = user.prop("age").unwrap();
        assert!(filtered.intersects(&changes(user.id, vec![], vec![(age.start as u16, 1)])));
    }

    #[test]
    fn test_structural_changes_hit_root_type() {
        let defs = defs();
        let team = defs.get("team").unwrap();
        let sub = compile_query(Query::new("team").def(), &defs).unwrap().sub;
        let mut c = ChangeSet::default();
        c.structural.push(team.id);
        assert!(sub.intersects(&c));
        assert!(!sub.intersects(&ChangeSet::default()));
    }
}
