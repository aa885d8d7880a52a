//! Property tests for role resolution

use super::resolver::RoleResolver;
use crate::error::AuthzError;
use crate::types::{Role, RoleRecord, RoleSource, SubjectId};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn arb_role() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

fn arb_source() -> impl Strategy<Value = RoleSource> {
    prop::sample::select(vec![RoleSource::AssignmentTable, RoleSource::ProfileField])
}

fn arb_records(min: usize) -> impl Strategy<Value = Vec<RoleRecord>> {
    prop::collection::vec((arb_role(), arb_source()), min..12).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(role, source)| RoleRecord::new("user:prop", role, source))
            .collect()
    })
}

proptest! {
    #[test]
    fn test_resolution_is_union_of_records(records in arb_records(1)) {
        let resolver = RoleResolver::new();
        let subject = SubjectId::new("user:prop");

        let resolution = resolver.resolve(&subject, &records).unwrap();
        let union: BTreeSet<Role> = records.iter().map(|r| r.role).collect();

        prop_assert_eq!(resolution.roles.as_set(), &union);
        prop_assert!(resolution.roles.contains(resolution.primary));
    }

    #[test]
    fn test_resolution_is_order_independent(
        (records, shuffled) in arb_records(1)
            .prop_flat_map(|records| (Just(records.clone()), Just(records).prop_shuffle()))
    ) {
        let resolver = RoleResolver::new();
        let subject = SubjectId::new("user:prop");

        let first = resolver.resolve(&subject, &records).unwrap();
        let second = resolver.resolve(&subject, &shuffled).unwrap();

        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_primary_has_highest_precedence(records in arb_records(1)) {
        let resolver = RoleResolver::new();
        let subject = SubjectId::new("user:prop");

        let resolution = resolver.resolve(&subject, &records).unwrap();
        let precedence = resolver.precedence();
        let best_rank = resolution.roles.iter().map(|r| precedence.rank(r)).min().unwrap();

        prop_assert_eq!(precedence.rank(resolution.primary), best_rank);
    }
}

#[test]
fn test_empty_input_never_defaults_to_a_role() {
    let resolver = RoleResolver::new();
    let result = resolver.resolve(&SubjectId::new("user:prop"), &[]);
    assert!(matches!(result, Err(AuthzError::NoRoleAssigned(_))));
}
