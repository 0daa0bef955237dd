//! Operation selections and the transforms applied before they are sent
//! downstream.
//!
//! Selections are the closed union [`Selection`]; every transform here is a
//! plain `(node) -> node'` function matching all three variants.

use crate::error::{Error, Result};
use crate::field_set::{requirement_alias, FieldSet, FieldSetItem, REQUIREMENT_ALIAS_PREFIX};
use crate::graph::{FieldCoordinate, ServiceId};
use crate::merge::UnifiedGraph;
use crate::registry::ResolutionContext;
use async_graphql::indexmap::IndexMap;
use async_graphql::parser::types::{
    Directive, DocumentOperations, ExecutableDocument, FragmentDefinition, SelectionSet,
};
use async_graphql::parser::parse_query;
use async_graphql::{Name, Positioned, Value as GqlValue};
use std::collections::HashMap;
use std::fmt;

pub const TYPENAME: &str = "__typename";

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(FieldSelection),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, GqlValue)>,
    pub selections: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selections: Vec<Selection>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FragmentSpread {
    pub name: String,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selections: Vec::new(),
        }
    }

    pub fn typename() -> Self {
        Self::new(TYPENAME)
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<GqlValue>) -> Self {
        self.arguments.push((name.into(), value.into()));
        self
    }

    pub fn selection(mut self, selection: Selection) -> Self {
        self.selections.push(selection);
        self
    }

    /// Key of this field in a response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// The same selection without alias, as it is identified inside a batch.
    pub fn unaliased(&self) -> FieldSelection {
        FieldSelection {
            alias: None,
            ..self.clone()
        }
    }

    /// Parse a single root field selection such as `currentUser { id }`.
    /// Variables are not allowed.
    pub fn parse(query: &str) -> std::result::Result<Self, String> {
        let document = parse_query(format!("{{ {query} }}")).map_err(|e| e.to_string())?;
        let ExecutableDocument {
            operations: DocumentOperations::Single(operation),
            ..
        } = document
        else {
            return Err("expected a single selection".to_string());
        };

        let no_variables = IndexMap::new();
        let mut selections = from_ast(&operation.node.selection_set.node, &no_variables)
            .map_err(|e| e.to_string())?;
        match (selections.pop(), selections.is_empty()) {
            (Some(Selection::Field(field)), true) => Ok(field),
            _ => Err("expected exactly one field".to_string()),
        }
    }
}

impl From<FieldSelection> for Selection {
    fn from(field: FieldSelection) -> Self {
        Selection::Field(field)
    }
}

/// Request variables, already converted to constant values.
pub type Variables = IndexMap<Name, GqlValue>;

/// Convert a parsed selection set, substituting variables and evaluating
/// `@skip`/`@include`. Fragment spreads are kept as spreads; see
/// [`inline_fragments`].
pub fn from_ast(set: &SelectionSet, variables: &Variables) -> Result<Vec<Selection>> {
    use async_graphql::parser::types::Selection as Ast;

    let mut out = Vec::with_capacity(set.items.len());
    for item in &set.items {
        let selection = match &item.node {
            Ast::Field(field) => {
                let field = &field.node;
                if !include(&field.directives, variables)? {
                    continue;
                }
                let arguments = field
                    .arguments
                    .iter()
                    .map(|(name, value)| {
                        let value = value.node.clone().into_const_with(|name| variable(variables, name))?;
                        Ok((name.node.to_string(), value))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let alias = field.alias.as_ref().map(|alias| alias.node.to_string());
                if let Some(alias) = alias.as_deref().filter(|a| a.starts_with(REQUIREMENT_ALIAS_PREFIX)) {
                    return Err(Error::InvalidRequest(format!(
                        "alias `{alias}` uses the reserved prefix `{REQUIREMENT_ALIAS_PREFIX}`"
                    )));
                }
                Selection::Field(FieldSelection {
                    alias,
                    name: field.name.node.to_string(),
                    arguments,
                    selections: from_ast(&field.selection_set.node, variables)?,
                })
            }
            Ast::InlineFragment(fragment) => {
                let fragment = &fragment.node;
                if !include(&fragment.directives, variables)? {
                    continue;
                }
                Selection::InlineFragment(InlineFragment {
                    type_condition: fragment
                        .type_condition
                        .as_ref()
                        .map(|condition| condition.node.on.node.to_string()),
                    selections: from_ast(&fragment.selection_set.node, variables)?,
                })
            }
            Ast::FragmentSpread(spread) => {
                let spread = &spread.node;
                if !include(&spread.directives, variables)? {
                    continue;
                }
                Selection::FragmentSpread(FragmentSpread {
                    name: spread.fragment_name.node.to_string(),
                })
            }
        };
        out.push(selection);
    }
    Ok(out)
}

/// Named fragments of an operation, converted once.
#[derive(Debug, Default)]
pub struct Fragments(HashMap<String, InlineFragment>);

impl Fragments {
    pub fn from_ast(
        fragments: &HashMap<Name, Positioned<FragmentDefinition>>,
        variables: &Variables,
    ) -> Result<Self> {
        let mut out = HashMap::with_capacity(fragments.len());
        for (name, definition) in fragments {
            let definition = &definition.node;
            out.insert(
                name.to_string(),
                InlineFragment {
                    type_condition: Some(definition.type_condition.node.on.node.to_string()),
                    selections: from_ast(&definition.selection_set.node, variables)?,
                },
            );
        }
        Ok(Self(out))
    }
}

/// Replace every fragment spread by an inline fragment. Spreads of unknown
/// or recursively used fragments are dropped.
pub fn inline_fragments(selections: &[Selection], fragments: &Fragments) -> Vec<Selection> {
    fn inline(selection: &Selection, fragments: &Fragments, active: &mut Vec<String>) -> Option<Selection> {
        match selection {
            Selection::Field(field) => Some(Selection::Field(FieldSelection {
                selections: inline_all(&field.selections, fragments, active),
                ..field.clone()
            })),
            Selection::InlineFragment(fragment) => Some(Selection::InlineFragment(InlineFragment {
                type_condition: fragment.type_condition.clone(),
                selections: inline_all(&fragment.selections, fragments, active),
            })),
            Selection::FragmentSpread(spread) => {
                if active.contains(&spread.name) {
                    tracing::warn!(fragment = %spread.name, "dropping recursive fragment spread");
                    return None;
                }
                let fragment = fragments.0.get(&spread.name)?;
                active.push(spread.name.clone());
                let selections = inline_all(&fragment.selections, fragments, active);
                active.pop();
                Some(Selection::InlineFragment(InlineFragment {
                    type_condition: fragment.type_condition.clone(),
                    selections,
                }))
            }
        }
    }

    fn inline_all(selections: &[Selection], fragments: &Fragments, active: &mut Vec<String>) -> Vec<Selection> {
        selections
            .iter()
            .filter_map(|s| inline(s, fragments, active))
            .collect()
    }

    inline_all(selections, fragments, &mut Vec::new())
}

fn include(directives: &[Positioned<Directive>], variables: &Variables) -> Result<bool> {
    for directive in directives {
        let directive = &directive.node;
        let expected = match directive.name.node.as_str() {
            "skip" => false,
            "include" => true,
            _ => continue,
        };
        let condition = directive
            .get_argument("if")
            .map(|value| value.node.clone().into_const_with(|name| variable(variables, name)))
            .transpose()?;
        match condition {
            Some(GqlValue::Boolean(flag)) if flag != expected => return Ok(false),
            Some(GqlValue::Boolean(_)) => {}
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "@{} requires a boolean `if` argument",
                    directive.name.node
                )))
            }
        }
    }
    Ok(true)
}

fn variable(variables: &Variables, name: Name) -> Result<GqlValue> {
    variables
        .get(&name)
        .cloned()
        .ok_or_else(|| Error::InvalidRequest(format!("variable `${name}` is not defined")))
}

/// Rewrites a selection set for one downstream service.
///
/// Fields the service does not own are removed; the key and `@requires`
/// fields needed to resolve them afterwards are added in their place; every
/// composite selection set gets `__typename`.
pub struct DownstreamRewriter<'a> {
    graph: &'a UnifiedGraph,
    service: &'a ServiceId,
}

impl<'a> DownstreamRewriter<'a> {
    pub fn new(graph: &'a UnifiedGraph, service: &'a ServiceId) -> Self {
        Self { graph, service }
    }

    /// Rewrite the sub-selection of a field returning `type_name`.
    pub fn rewrite(&self, selections: &[Selection], type_name: &str) -> Vec<Selection> {
        let mut out = self.rewrite_inner(selections, type_name);
        if self.is_composite(type_name) && !has_plain_field(&out, TYPENAME) {
            out.insert(0, Selection::Field(FieldSelection::typename()));
        }
        out
    }

    fn rewrite_inner(&self, selections: &[Selection], type_name: &str) -> Vec<Selection> {
        let mut out = Vec::with_capacity(selections.len());
        let mut needed: Vec<FieldSet> = Vec::new();

        for selection in selections {
            match selection {
                Selection::Field(field) if field.name == TYPENAME => out.push(selection.clone()),
                Selection::Field(field) => {
                    let coordinate = FieldCoordinate::new(type_name, field.name.as_str());
                    let Some(context) = self.graph.resolution(&coordinate) else {
                        continue;
                    };
                    if self.owns(context) {
                        let selections = match self.graph.field(&coordinate) {
                            Some(def) if self.is_composite(def.ty.named_type()) => {
                                self.rewrite(&field.selections, def.ty.named_type())
                            }
                            _ => Vec::new(),
                        };
                        out.push(Selection::Field(FieldSelection {
                            selections,
                            ..field.clone()
                        }));
                    } else {
                        needed.extend(self.requirements(context, type_name, &field.name));
                    }
                }
                Selection::InlineFragment(fragment) => {
                    let condition = fragment.type_condition.as_deref().unwrap_or(type_name);
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: fragment.type_condition.clone(),
                        selections: self.rewrite_inner(&fragment.selections, condition),
                    }));
                }
                Selection::FragmentSpread(spread) => {
                    tracing::warn!(fragment = %spread.name, "fragment spread reached the downstream rewriter");
                }
            }
        }

        for set in &needed {
            merge_field_set(&mut out, set.items());
        }
        out
    }

    fn owns(&self, context: &ResolutionContext) -> bool {
        match context {
            ResolutionContext::Owned(service) => service == self.service,
            ResolutionContext::EntityExtension(spec) => &spec.service == self.service,
            ResolutionContext::Static => true,
            ResolutionContext::ResolverArgument(_) => false,
        }
    }

    /// Fields the parent object must carry so that `field`, owned elsewhere,
    /// can be resolved later.
    fn requirements(&self, context: &ResolutionContext, type_name: &str, field: &str) -> Vec<FieldSet> {
        match context {
            ResolutionContext::EntityExtension(spec) => {
                let mut sets: Vec<FieldSet> = spec.keys.first().map(|k| k.fields().clone()).into_iter().collect();
                sets.extend(spec.requires(field).cloned());
                sets
            }
            ResolutionContext::Owned(owner) => self
                .graph
                .federation()
                .entity(type_name)
                .filter(|entity| &entity.service == owner)
                .and_then(|entity| entity.keys.first())
                .map(|key| vec![key.fields().clone()])
                .unwrap_or_default(),
            ResolutionContext::Static | ResolutionContext::ResolverArgument(_) => Vec::new(),
        }
    }

    fn is_composite(&self, type_name: &str) -> bool {
        self.graph
            .get_type(type_name)
            .is_some_and(|ty| ty.kind.is_composite())
    }
}

fn has_plain_field(selections: &[Selection], name: &str) -> bool {
    selections
        .iter()
        .any(|s| matches!(s, Selection::Field(f) if f.alias.is_none() && f.name == name))
}

/// Add the fields of a requirement set to `selections`. A field the
/// selection already has unaliased is reused; when a different selection
/// occupies its response key it is added under [`requirement_alias`].
fn merge_field_set(selections: &mut Vec<Selection>, items: &[FieldSetItem]) {
    for item in items {
        let existing = selections.iter_mut().find_map(|s| match s {
            Selection::Field(f) if f.alias.is_none() && f.name == item.name && f.arguments.is_empty() => Some(f),
            _ => None,
        });
        match existing {
            Some(field) => merge_field_set(&mut field.selections, &item.selections),
            None => {
                let mut field = FieldSelection::new(item.name.as_str());
                if occupies(selections, &item.name) {
                    field.alias = Some(requirement_alias(&item.name));
                }
                merge_field_set(&mut field.selections, &item.selections);
                selections.push(Selection::Field(field));
            }
        }
    }
}

/// Whether any field of `selections`, inline fragments included, answers
/// under `key`.
fn occupies(selections: &[Selection], key: &str) -> bool {
    selections.iter().any(|s| match s {
        Selection::Field(field) => field.response_key() == key,
        Selection::InlineFragment(fragment) => occupies(&fragment.selections, key),
        Selection::FragmentSpread(_) => false,
    })
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Field(field) => write!(f, "{field}"),
            Selection::InlineFragment(fragment) => {
                f.write_str("...")?;
                if let Some(condition) = &fragment.type_condition {
                    write!(f, " on {condition}")?;
                }
                f.write_str(" ")?;
                write_selection_set(f, &fragment.selections)
            }
            Selection::FragmentSpread(spread) => write!(f, "...{}", spread.name),
        }
    }
}

impl fmt::Display for FieldSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}: ")?;
        }
        f.write_str(&self.name)?;
        if !self.arguments.is_empty() {
            f.write_str("(")?;
            for (i, (name, value)) in self.arguments.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            f.write_str(")")?;
        }
        if !self.selections.is_empty() {
            f.write_str(" ")?;
            write_selection_set(f, &self.selections)?;
        }
        Ok(())
    }
}

/// Write `{ a b { c } }`.
pub fn write_selection_set(f: &mut impl fmt::Write, selections: &[Selection]) -> fmt::Result {
    f.write_str("{")?;
    for selection in selections {
        write!(f, " {selection}")?;
    }
    f.write_str(" }")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_selections(query: &str, variables: &Variables) -> (Vec<Selection>, Fragments) {
        let document = parse_query(query).unwrap();
        let DocumentOperations::Single(operation) = &document.operations else {
            panic!("single operation expected");
        };
        let fragments = Fragments::from_ast(&document.fragments, variables).unwrap();
        let selections = from_ast(&operation.node.selection_set.node, variables).unwrap();
        (selections, fragments)
    }

    fn render(selections: &[Selection]) -> String {
        let mut out = String::new();
        write_selection_set(&mut out, selections).unwrap();
        out
    }

    #[test]
    fn substitutes_variables_and_evaluates_skip() {
        let mut variables = Variables::new();
        variables.insert(Name::new("id"), GqlValue::from("p1"));
        variables.insert(Name::new("hide"), GqlValue::Boolean(true));

        let (selections, _) = parse_selections(
            r#"query($id: ID!, $hide: Boolean!) { product(id: $id) { name secret @skip(if: $hide) } }"#,
            &variables,
        );
        assert_eq!(render(&selections), r#"{ product(id: "p1") { name } }"#);
    }

    #[test]
    fn undefined_variable_is_rejected() {
        let document = parse_query("query { product(id: $missing) { name } }").unwrap();
        let DocumentOperations::Single(operation) = &document.operations else {
            unreachable!()
        };
        let err = from_ast(&operation.node.selection_set.node, &Variables::new()).unwrap_err();
        assert!(err.to_string().contains("$missing"));
    }

    #[test]
    fn spreads_become_inline_fragments() {
        let (selections, fragments) = parse_selections(
            "{ product { ...Details } } fragment Details on Product { name ...Details }",
            &Variables::new(),
        );
        let inlined = inline_fragments(&selections, &fragments);
        assert_eq!(render(&inlined), "{ product { ... on Product { name } } }");
    }

    #[test]
    fn parses_single_root_field() {
        let field = FieldSelection::parse(r#"viewer(scope: "all") { id }"#).unwrap();
        assert_eq!(field.name, "viewer");
        assert_eq!(field.to_string(), r#"viewer(scope: "all") { id }"#);
        assert!(FieldSelection::parse("a b").is_err());
    }

    #[test]
    fn merges_key_fields_into_existing_selections() {
        let mut selections = vec![Selection::Field(
            FieldSelection::new("org").selection(FieldSelection::new("name").into()),
        )];
        let key = FieldSet::parse("id org { id }").unwrap();
        merge_field_set(&mut selections, key.items());
        assert_eq!(render(&selections), "{ org { name id } id }");
    }

    #[test]
    fn key_field_is_aliased_when_its_name_is_taken() {
        let mut selections = vec![
            Selection::Field(FieldSelection {
                alias: Some("id".into()),
                ..FieldSelection::new("name")
            }),
            Selection::InlineFragment(InlineFragment {
                type_condition: None,
                selections: vec![Selection::Field(FieldSelection {
                    alias: Some("weight".into()),
                    ..FieldSelection::new("price")
                })],
            }),
        ];
        let key = FieldSet::parse("id weight").unwrap();
        merge_field_set(&mut selections, key.items());
        assert_eq!(
            render(&selections),
            "{ id: name ... { weight: price } _key_id: id _key_weight: weight }"
        );
    }

    #[test]
    fn reserved_alias_prefix_is_rejected() {
        let document = parse_query("{ product { _key_id: name } }").unwrap();
        let DocumentOperations::Single(operation) = &document.operations else {
            panic!("single operation expected");
        };
        let err = from_ast(&operation.node.selection_set.node, &Variables::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(message) if message.contains("_key_id")));
    }
}
