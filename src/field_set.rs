//! Field sets used by `@key`, `@requires` and `@provides`.

use async_graphql::indexmap::IndexMap;
use async_graphql::parser::types::{DocumentOperations, ExecutableDocument, Selection};
use async_graphql::parser::parse_query;
use async_graphql::{Name, Positioned, Value as GqlValue};
use std::fmt;

/// Prefix of the response key a requirement field is fetched under when the
/// client's selection already uses the field's own name. Client aliases
/// starting with it are rejected.
pub const REQUIREMENT_ALIAS_PREFIX: &str = "_key_";

pub fn requirement_alias(name: &str) -> String {
    format!("{REQUIREMENT_ALIAS_PREFIX}{name}")
}

/// Value of the field-set field `name` in a fetched object, preferring the
/// aliased copy a rewritten selection may have added.
pub fn read_field<'a>(map: &'a IndexMap<Name, GqlValue>, name: &str) -> Option<&'a GqlValue> {
    map.get(requirement_alias(name).as_str()).or_else(|| map.get(name))
}

/// One field of a field set, possibly with a nested selection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldSetItem {
    pub name: String,
    pub selections: Vec<FieldSetItem>,
}

/// An ordered set of field selections, e.g. `id organization { id }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldSet(Vec<FieldSetItem>);

impl FieldSet {
    /// Parse the string value of a `fields:` argument.
    ///
    /// The string is wrapped in braces and parsed as an anonymous query, so any
    /// whitespace or comma separation GraphQL accepts is accepted here too.
    /// Fragments, aliases and arguments are rejected.
    pub fn parse(fields: &str) -> Result<Self, String> {
        let document = parse_query(format!("{{ {fields} }}")).map_err(|e| e.to_string())?;

        let ExecutableDocument {
            operations: DocumentOperations::Single(operation),
            ..
        } = document
        else {
            return Err("field set must be a single selection set".to_string());
        };

        let items = build_items(&operation.node.selection_set.node.items)?;
        if items.is_empty() {
            return Err("field set is empty".to_string());
        }
        Ok(Self(items))
    }

    pub fn items(&self) -> &[FieldSetItem] {
        &self.0
    }

    /// Top-level field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|item| item.name.as_str())
    }

    /// Every selected path, e.g. `["id"]`, `["organization", "id"]`.
    pub fn paths(&self) -> Vec<Vec<&str>> {
        fn walk<'a>(items: &'a [FieldSetItem], prefix: &mut Vec<&'a str>, out: &mut Vec<Vec<&'a str>>) {
            for item in items {
                prefix.push(&item.name);
                if item.selections.is_empty() {
                    out.push(prefix.clone());
                } else {
                    walk(&item.selections, prefix, out);
                }
                prefix.pop();
            }
        }

        let mut out = Vec::new();
        walk(&self.0, &mut Vec::new(), &mut out);
        out
    }

    /// True when every path of `self` is also selected by `other`.
    pub fn is_subset_of(&self, other: &FieldSet) -> bool {
        let theirs = other.paths();
        self.paths().iter().all(|path| theirs.contains(path))
    }

    /// Whether `source` carries a non-null value for every selected path.
    pub fn is_satisfied_by(&self, source: &IndexMap<Name, GqlValue>) -> bool {
        fn satisfied(items: &[FieldSetItem], value: &GqlValue) -> bool {
            match value {
                GqlValue::Object(map) => items.iter().all(|item| match read_field(map, &item.name) {
                    None | Some(GqlValue::Null) => false,
                    Some(_) if item.selections.is_empty() => true,
                    Some(nested) => satisfied(&item.selections, nested),
                }),
                GqlValue::List(values) => values.iter().all(|v| satisfied(items, v)),
                _ => false,
            }
        }

        self.0.iter().all(|item| match read_field(source, &item.name) {
            None | Some(GqlValue::Null) => false,
            Some(_) if item.selections.is_empty() => true,
            Some(nested) => satisfied(&item.selections, nested),
        })
    }

    /// Copy the selected values out of `source` into `target` under their
    /// plain names. Missing values are skipped; nested selections project
    /// the nested objects.
    pub fn project_into(&self, source: &IndexMap<Name, GqlValue>, target: &mut IndexMap<Name, GqlValue>) {
        for item in &self.0 {
            let Some(value) = read_field(source, &item.name) else {
                continue;
            };
            target.insert(Name::new(&item.name), project(&item.selections, value));
        }
    }
}

fn project(items: &[FieldSetItem], value: &GqlValue) -> GqlValue {
    if items.is_empty() {
        return value.clone();
    }
    match value {
        GqlValue::Object(map) => {
            let mut out = IndexMap::new();
            for item in items {
                if let Some(nested) = read_field(map, &item.name) {
                    out.insert(Name::new(&item.name), project(&item.selections, nested));
                }
            }
            GqlValue::Object(out)
        }
        GqlValue::List(values) => GqlValue::List(values.iter().map(|v| project(items, v)).collect()),
        other => other.clone(),
    }
}

fn build_items(items: &[Positioned<Selection>]) -> Result<Vec<FieldSetItem>, String> {
    items
        .iter()
        .map(|item| match &item.node {
            Selection::Field(field) => {
                let field = &field.node;
                if field.alias.is_some() || !field.arguments.is_empty() {
                    return Err(format!(
                        "aliases and arguments are not allowed in field sets (`{}`)",
                        field.name.node
                    ));
                }
                Ok(FieldSetItem {
                    name: field.name.node.to_string(),
                    selections: build_items(&field.selection_set.node.items)?,
                })
            }
            Selection::FragmentSpread(_) | Selection::InlineFragment(_) => {
                Err("fragments are not allowed in field sets".to_string())
            }
        })
        .collect()
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_items(f: &mut fmt::Formatter<'_>, items: &[FieldSetItem]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                f.write_str(&item.name)?;
                if !item.selections.is_empty() {
                    f.write_str(" { ")?;
                    write_items(f, &item.selections)?;
                    f.write_str(" }")?;
                }
            }
            Ok(())
        }
        write_items(f, &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_and_nested_sets() {
        let set = FieldSet::parse("upc  organization { id }").expect("valid field set");
        assert_eq!(set.field_names().collect::<Vec<_>>(), vec!["upc", "organization"]);
        assert_eq!(set.paths(), vec![vec!["upc"], vec!["organization", "id"]]);
        assert_eq!(set.to_string(), "upc organization { id }");
    }

    #[test]
    fn rejects_fragments_and_empty_sets() {
        assert!(FieldSet::parse("... on Product { id }").is_err());
        assert!(FieldSet::parse("").is_err());
        assert!(FieldSet::parse("id(format: 1)").is_err());
    }

    #[test]
    fn subset_compares_paths() {
        let key = FieldSet::parse("id").unwrap();
        let composite = FieldSet::parse("id sku").unwrap();
        assert!(key.is_subset_of(&composite));
        assert!(!composite.is_subset_of(&key));
    }

    #[test]
    fn projects_nested_values() {
        let set = FieldSet::parse("id owner { id }").unwrap();
        let source = match GqlValue::from_json(serde_json::json!({
            "id": "p1",
            "name": "Widget",
            "owner": { "id": "u1", "email": "a@b" }
        }))
        .unwrap()
        {
            GqlValue::Object(map) => map,
            _ => unreachable!(),
        };

        assert!(set.is_satisfied_by(&source));
        let mut target = IndexMap::new();
        set.project_into(&source, &mut target);
        assert_eq!(
            GqlValue::Object(target).into_json().unwrap(),
            serde_json::json!({ "id": "p1", "owner": { "id": "u1" } })
        );
    }

    #[test]
    fn aliased_requirement_wins_over_the_plain_name() {
        let set = FieldSet::parse("id owner { id }").unwrap();
        let source = match GqlValue::from_json(serde_json::json!({
            "id": "Widget",
            "_key_id": "p1",
            "owner": { "id": "Ada", "_key_id": "u1" }
        }))
        .unwrap()
        {
            GqlValue::Object(map) => map,
            _ => unreachable!(),
        };

        let mut target = IndexMap::new();
        set.project_into(&source, &mut target);
        assert_eq!(
            GqlValue::Object(target).into_json().unwrap(),
            serde_json::json!({ "id": "p1", "owner": { "id": "u1" } })
        );
    }
}
