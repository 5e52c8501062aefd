use crate::flags::TargetingRules;

use super::EvaluationContext;

/// Whether the context is explicitly excluded from the flag's targeting.
pub fn is_excluded(rules: &TargetingRules, context: &EvaluationContext) -> bool {
    context
        .user_id
        .as_deref()
        .is_some_and(|user_id| rules.excluded_user_ids.contains(user_id))
}

/// Evaluate the non-percentage targeting rules.
///
/// Categories are OR-ed: an explicit user id, any shared segment, or a listed country
/// selects the rule tier. Exclusion is checked first and wins over every category.
/// An absent context field simply does not match its category.
pub fn matches(rules: &TargetingRules, context: &EvaluationContext) -> bool {
    if is_excluded(rules, context) {
        return false;
    }

    if let Some(user_id) = context.user_id.as_deref() {
        if rules.user_ids.contains(user_id) {
            return true;
        }
    }

    if !rules.segments.is_disjoint(&context.segments) {
        return true;
    }

    match context.country.as_deref() {
        Some(country) => rules.countries.contains(country),
        None => false,
    }
}
