//! Field diffing and kind-specific auto-merge.

use std::collections::HashSet;

use crate::error::ItemError;
use crate::models::{
    ConflictField, EntityData, IngredientData, MergeStrategy, PackagingData, RecipeData,
};

/// Semantic fields that differ between a client edit and the server copy.
///
/// Recipes always report `version`: the recipe's own version label is what
/// the conflict is about even when nothing else changed.
#[must_use]
pub fn conflict_fields(client: &EntityData, server: &EntityData) -> Vec<ConflictField> {
    match (client, server) {
        (EntityData::Ingredient(client), EntityData::Ingredient(server)) => {
            let mut fields = Vec::new();
            if client.name != server.name {
                fields.push(ConflictField::Name);
            }
            if !same_amount(client.current_price, server.current_price) {
                fields.push(ConflictField::CurrentPrice);
            }
            if client.is_complimentary != server.is_complimentary {
                fields.push(ConflictField::IsComplimentary);
            }
            if client.is_active != server.is_active {
                fields.push(ConflictField::IsActive);
            }
            fields
        }
        (EntityData::Recipe(client), EntityData::Recipe(server)) => {
            let mut fields = vec![ConflictField::Version];
            if client.name != server.name {
                fields.push(ConflictField::Name);
            }
            if client.lines != server.lines {
                fields.push(ConflictField::Lines);
            }
            fields
        }
        (EntityData::Packaging(client), EntityData::Packaging(server)) => {
            let mut fields = Vec::new();
            if !same_optional_amount(client.unit_cost, server.unit_cost) {
                fields.push(ConflictField::UnitCost);
            }
            if client.packaging_type != server.packaging_type {
                fields.push(ConflictField::PackagingType);
            }
            fields
        }
        (EntityData::Ingredient(_) | EntityData::Recipe(_) | EntityData::Packaging(_), _) => {
            Vec::new()
        }
    }
}

/// Combine client and server data with the algorithm for their kind.
pub fn merge_entities(
    client: &EntityData,
    server: &EntityData,
    strategy: MergeStrategy,
) -> Result<EntityData, ItemError> {
    match (client, server) {
        (EntityData::Ingredient(client), EntityData::Ingredient(server)) => {
            Ok(EntityData::Ingredient(merge_ingredient(client, server)))
        }
        (EntityData::Recipe(client), EntityData::Recipe(server)) => {
            Ok(EntityData::Recipe(merge_recipe(client, server, strategy)))
        }
        (EntityData::Packaging(client), EntityData::Packaging(server)) => {
            Ok(EntityData::Packaging(merge_packaging(client, server)))
        }
        (EntityData::Ingredient(_) | EntityData::Recipe(_) | EntityData::Packaging(_), _) => {
            Err(ItemError::KindMismatch {
                expected: server.kind(),
                found: client.kind(),
            })
        }
    }
}

/// Server fields, with:
/// - price from whichever side changed it most recently (falling back to a
///   non-zero price over zero, then to the server),
/// - active if either side is active,
/// - complimentary only if both sides agree.
#[must_use]
pub fn merge_ingredient(client: &IngredientData, server: &IngredientData) -> IngredientData {
    let client_price_wins = match (client.price_updated_at, server.price_updated_at) {
        (Some(client_at), Some(server_at)) if client_at != server_at => client_at > server_at,
        _ => is_zero(server.current_price) && !is_zero(client.current_price),
    };

    let (current_price, price_updated_at) = if client_price_wins {
        (client.current_price, client.price_updated_at)
    } else {
        (server.current_price, server.price_updated_at)
    };

    IngredientData {
        current_price,
        price_updated_at,
        is_active: client.is_active || server.is_active,
        is_complimentary: client.is_complimentary && server.is_complimentary,
        ..server.clone()
    }
}

/// Server lines first, then client lines for ingredients the server recipe
/// does not use. Duplicate ingredient ids on the client side keep the first.
#[must_use]
pub fn merge_recipe(client: &RecipeData, server: &RecipeData, strategy: MergeStrategy) -> RecipeData {
    match strategy {
        MergeStrategy::UnionIngredients => {
            let mut seen: HashSet<&str> = server
                .lines
                .iter()
                .map(|line| line.ingredient_id.as_str())
                .collect();
            let mut lines = server.lines.clone();
            for line in &client.lines {
                if seen.insert(line.ingredient_id.as_str()) {
                    lines.push(line.clone());
                }
            }
            RecipeData {
                lines,
                ..server.clone()
            }
        }
    }
}

/// Server fields, with the client's unit cost when it is set and positive.
#[must_use]
pub fn merge_packaging(client: &PackagingData, server: &PackagingData) -> PackagingData {
    let unit_cost = match client.unit_cost {
        Some(cost) if cost > 0.0 => Some(cost),
        _ => server.unit_cost,
    };
    PackagingData {
        unit_cost,
        ..server.clone()
    }
}

fn is_zero(amount: f64) -> bool {
    amount.abs() < f64::EPSILON
}

fn same_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

fn same_optional_amount(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => same_amount(a, b),
        (None, None) => true,
        _ => false,
    }
}
