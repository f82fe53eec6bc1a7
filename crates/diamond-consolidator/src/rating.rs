//! Rating rule evaluation: first full-facet match wins. Rules are walked
//! in ascending priority order and the first one whose every specified
//! facet matches the diamond is the winner.

use diamond_schemas::{DiamondAttributes, RatingRule, RatingRuleFacets};

fn str_matches(candidates: &Option<Vec<String>>, value: &str) -> bool {
    match candidates {
        None => true,
        Some(list) => list.iter().any(|c| c.eq_ignore_ascii_case(value)),
    }
}

fn opt_str_matches(candidates: &Option<Vec<String>>, value: &Option<String>) -> bool {
    match candidates {
        None => true,
        Some(list) => value.as_deref().map(|v| list.iter().any(|c| c.eq_ignore_ascii_case(v))).unwrap_or(false),
    }
}

fn range_matches(min: Option<f64>, max: Option<f64>, value: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(v) = value else { return false };
    min.map(|m| v >= m).unwrap_or(true) && max.map(|m| v <= m).unwrap_or(true)
}

fn facets_match(facets: &RatingRuleFacets, attrs: &DiamondAttributes, feed: &str, price: f64) -> bool {
    str_matches(&facets.shapes, &attrs.shape)
        && str_matches(&facets.colors, &attrs.color)
        && str_matches(&facets.clarities, &attrs.clarity)
        && opt_str_matches(&facets.cuts, &attrs.cut)
        && opt_str_matches(&facets.polish, &attrs.polish)
        && opt_str_matches(&facets.symmetry, &attrs.symmetry)
        && opt_str_matches(&facets.fluorescence, &attrs.fluorescence)
        && opt_str_matches(&facets.labs, &attrs.lab)
        && facets.lab_grown.map(|want| want == attrs.lab_grown).unwrap_or(true)
        && range_matches(facets.carat_min, facets.carat_max, Some(attrs.carats))
        && range_matches(facets.table_min, facets.table_max, attrs.table_pct)
        && range_matches(facets.depth_min, facets.depth_max, attrs.depth_pct)
        && range_matches(facets.crown_min, facets.crown_max, attrs.crown_angle)
        && range_matches(facets.pavilion_min, facets.pavilion_max, attrs.pavilion_angle)
        && opt_str_matches(&facets.girdle, &attrs.girdle)
        && opt_str_matches(&facets.culet, &attrs.culet)
        && range_matches(facets.ratio_min, facets.ratio_max, attrs.ratio())
        && range_matches(facets.price_min, facets.price_max, Some(price))
        && facets.feed.as_deref().map(|f| f.eq_ignore_ascii_case(feed)).unwrap_or(true)
}

/// Walk `rules` (must already be ordered ascending by priority) and return
/// the first full match's rating. `None` if nothing matches.
pub fn evaluate_rating(rules: &[RatingRule], attrs: &DiamondAttributes, feed: &str, price: f64) -> Option<i32> {
    rules
        .iter()
        .find(|r| r.active && facets_match(&r.facets, attrs, feed, price))
        .map(|r| r.rating)
}

#[cfg(test)]
mod tests {
    use super::*;
    use diamond_schemas::StoneType;
    use uuid::Uuid;

    fn sample_attrs() -> DiamondAttributes {
        DiamondAttributes {
            shape: "ROUND".into(),
            color: "G".into(),
            clarity: "VS1".into(),
            cut: Some("EXCELLENT".into()),
            carats: 1.01,
            polish: Some("EXCELLENT".into()),
            symmetry: Some("EXCELLENT".into()),
            fluorescence: Some("None".into()),
            lab: Some("GIA".into()),
            certificate: Some("1234567".into()),
            lab_grown: false,
            fancy_color: None,
            length_mm: Some(6.5),
            width_mm: Some(6.52),
            depth_mm: Some(4.0),
            table_pct: Some(58.0),
            depth_pct: Some(61.5),
            crown_angle: Some(34.5),
            pavilion_angle: Some(40.8),
            girdle: Some("MEDIUM".into()),
            culet: Some("NONE".into()),
            media_urls: vec![],
        }
    }

    fn rule(priority: i32, facets: RatingRuleFacets, rating: i32) -> RatingRule {
        RatingRule {
            id: Uuid::new_v4(),
            priority,
            facets,
            rating,
            active: true,
        }
    }

    #[test]
    fn unspecified_facets_never_disqualify() {
        let rules = vec![rule(1, RatingRuleFacets::default(), 5)];
        assert_eq!(evaluate_rating(&rules, &sample_attrs(), "demo", 4200.0), Some(5));
    }

    #[test]
    fn first_full_match_wins_over_a_later_looser_rule() {
        let narrow = RatingRuleFacets {
            shapes: Some(vec!["OVAL".into()]),
            ..Default::default()
        };
        let wide = RatingRuleFacets::default();
        let rules = vec![rule(1, narrow, 9), rule(2, wide, 3)];
        assert_eq!(evaluate_rating(&rules, &sample_attrs(), "demo", 4200.0), Some(3));
    }

    #[test]
    fn no_match_leaves_rating_none() {
        let narrow = RatingRuleFacets {
            shapes: Some(vec!["OVAL".into()]),
            ..Default::default()
        };
        let rules = vec![rule(1, narrow, 9)];
        assert_eq!(evaluate_rating(&rules, &sample_attrs(), "demo", 4200.0), None);
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let mut r = rule(1, RatingRuleFacets::default(), 9);
        r.active = false;
        assert_eq!(evaluate_rating(&[r], &sample_attrs(), "demo", 4200.0), None);
    }

    #[test]
    fn stone_type_helper_is_unaffected_by_rating_evaluation() {
        // Sanity check that DiamondAttributes::stone_type is still natural
        // for this fixture — rating evaluation doesn't touch it.
        assert_eq!(sample_attrs().stone_type(), StoneType::Natural);
    }
}
