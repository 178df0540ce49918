//! Deterministic skill-matching engine.
//!
//! Scores a user's skill profile against a job's requirements on a 0-100 scale:
//! up to 60 points for mandatory skills, up to 30 for optional skills and up to 10 for
//! experience. The engine performs no I/O and depends only on its two input slices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MANDATORY_POINTS: f64 = 60.0;
const OPTIONAL_POINTS: f64 = 30.0;
const EXPERIENCE_POINTS: f64 = 10.0;

/// Skill held by a user, as read from the profile store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSkill {
    pub skill_id: Uuid,
    pub skill_name: String,
    /// Proficiency in `[0, 5]`; out-of-range values are clamped.
    pub proficiency_level: i32,
    pub years_experience: i32,
}

/// Fully resolved requirement consumed by [`calculate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirement {
    pub skill_id: Uuid,
    pub skill_name: String,
    pub required_level: i32,
    pub is_mandatory: bool,
    /// Zero or negative means "no experience requirement".
    pub required_years: i32,
}

impl JobRequirement {
    /// Requirement carrying only an importance weight; every other field takes its default.
    pub fn from_importance(skill_id: Uuid, skill_name: impl Into<String>, importance: i32) -> Self {
        RequirementSpec {
            skill_id,
            skill_name: skill_name.into(),
            importance_weight: importance,
            required_level: None,
            is_mandatory: None,
            required_years: None,
        }
        .resolve()
    }
}

/// Stored requirement whose level, mandatory flag and years are optional overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub skill_id: Uuid,
    pub skill_name: String,
    pub importance_weight: i32,
    pub required_level: Option<i32>,
    pub is_mandatory: Option<bool>,
    pub required_years: Option<i32>,
}

impl RequirementSpec {
    /// Resolve overrides against importance-derived defaults.
    ///
    /// - level: explicit value clamped to `[1, 5]`, else importance clamped to `[1, 5]`
    /// - mandatory: explicit flag, else importance `>= 4`
    /// - years: explicit value floored at 0, else the resolved level
    pub fn resolve(&self) -> JobRequirement {
        let required_level = self
            .required_level
            .unwrap_or(self.importance_weight)
            .clamp(1, 5);
        let is_mandatory = self.is_mandatory.unwrap_or(self.importance_weight >= 4);
        let required_years = match self.required_years {
            Some(years) => years.max(0),
            None => required_level,
        };
        JobRequirement {
            skill_id: self.skill_id,
            skill_name: self.skill_name.clone(),
            required_level,
            is_mandatory,
            required_years,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedSkill {
    pub skill_id: Uuid,
    pub skill_name: String,
    /// Rounded contribution; the unrounded value feeds the total.
    pub score_contribution: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSkill {
    pub skill_id: Uuid,
    pub skill_name: String,
    pub is_mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchResult {
    /// Final score in `[0, 100]`.
    pub match_score: i32,
    pub mandatory_missing: bool,
    /// Mandatory matches first, then optional, each in requirement order.
    pub matched_skills: Vec<MatchedSkill>,
    pub missing_skills: Vec<MissingSkill>,
}

/// Score a user against fully resolved requirements.
///
/// Entries with a nil skill id are ignored on both sides. Duplicate user skill ids keep
/// the last entry.
pub fn calculate(user_skills: &[UserSkill], requirements: &[JobRequirement]) -> MatchResult {
    let mut user_by_skill: HashMap<Uuid, &UserSkill> = HashMap::with_capacity(user_skills.len());
    for skill in user_skills {
        if skill.skill_id.is_nil() {
            continue;
        }
        user_by_skill.insert(skill.skill_id, skill);
    }

    let (mandatory, optional): (Vec<&JobRequirement>, Vec<&JobRequirement>) = requirements
        .iter()
        .filter(|r| !r.skill_id.is_nil())
        .partition(|r| r.is_mandatory);

    let mandatory_weight = per_skill_weight(MANDATORY_POINTS, mandatory.len());
    let optional_weight = per_skill_weight(OPTIONAL_POINTS, optional.len());

    let mut result = MatchResult::default();
    let mut presence_total = 0.0;
    let mut experience_sum = 0.0;
    let mut experience_count = 0usize;

    let groups = [(&mandatory, mandatory_weight), (&optional, optional_weight)];
    for (group, weight) in groups {
        for requirement in group.iter() {
            experience_count += 1;
            let Some(user_skill) = user_by_skill.get(&requirement.skill_id) else {
                if requirement.is_mandatory {
                    result.mandatory_missing = true;
                }
                result.missing_skills.push(MissingSkill {
                    skill_id: requirement.skill_id,
                    skill_name: requirement.skill_name.clone(),
                    is_mandatory: requirement.is_mandatory,
                });
                continue;
            };

            let contribution = level_credit(user_skill, requirement, weight);
            presence_total += contribution;
            experience_sum += experience_ratio(user_skill, requirement);
            result.matched_skills.push(MatchedSkill {
                skill_id: requirement.skill_id,
                skill_name: requirement.skill_name.clone(),
                score_contribution: contribution.round() as i32,
            });
        }
    }

    let experience_bonus = if experience_count > 0 {
        EXPERIENCE_POINTS * (experience_sum / experience_count as f64)
    } else {
        0.0
    };

    result.match_score = ((presence_total + experience_bonus).round() as i32).clamp(0, 100);
    result
}

/// Score a user against stored requirements, resolving overrides through
/// [`RequirementSpec::resolve`] first.
pub fn calculate_v2(user_skills: &[UserSkill], requirements: &[RequirementSpec]) -> MatchResult {
    let resolved: Vec<JobRequirement> = requirements.iter().map(RequirementSpec::resolve).collect();
    calculate(user_skills, &resolved)
}

fn per_skill_weight(points: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        points / count as f64
    }
}

fn level_credit(user: &UserSkill, requirement: &JobRequirement, weight: f64) -> f64 {
    let required = requirement.required_level.clamp(1, 5);
    let level = user.proficiency_level.clamp(0, 5);
    if level == 0 {
        0.0
    } else if level >= required {
        weight
    } else {
        weight * (level as f64 / required as f64)
    }
}

fn experience_ratio(user: &UserSkill, requirement: &JobRequirement) -> f64 {
    if requirement.required_years <= 0 {
        return 1.0;
    }
    if user.years_experience <= 0 {
        return 0.0;
    }
    (user.years_experience as f64 / requirement.required_years as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill_id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn user(id: u128, level: i32, years: i32) -> UserSkill {
        UserSkill {
            skill_id: skill_id(id),
            skill_name: format!("skill-{id}"),
            proficiency_level: level,
            years_experience: years,
        }
    }

    fn req(id: u128, level: i32, mandatory: bool, years: i32) -> JobRequirement {
        JobRequirement {
            skill_id: skill_id(id),
            skill_name: format!("skill-{id}"),
            required_level: level,
            is_mandatory: mandatory,
            required_years: years,
        }
    }

    #[test]
    fn zero_requirements_scores_zero() {
        let result = calculate(&[user(1, 5, 5)], &[]);
        assert_eq!(result.match_score, 0);
        assert!(!result.mandatory_missing);
        assert!(result.matched_skills.is_empty());
        assert!(result.missing_skills.is_empty());
    }

    #[test]
    fn mandatory_met_optional_missing_scores_sixty_five() {
        let requirements = vec![req(1, 4, true, 2), req(2, 2, false, 0)];
        let result = calculate(&[user(1, 5, 3)], &requirements);

        assert_eq!(result.matched_skills.len(), 1);
        assert_eq!(result.matched_skills[0].skill_id, skill_id(1));
        assert_eq!(result.matched_skills[0].score_contribution, 60);
        assert_eq!(
            result.missing_skills,
            vec![MissingSkill {
                skill_id: skill_id(2),
                skill_name: "skill-2".into(),
                is_mandatory: false,
            }]
        );
        assert!(!result.mandatory_missing);
        assert_eq!(result.match_score, 65);
    }

    #[test]
    fn all_mandatory_met_yields_sixty_plus_full_experience() {
        let requirements = vec![req(1, 3, true, 0), req(2, 4, true, 0), req(3, 5, true, 0)];
        let users = vec![user(1, 3, 0), user(2, 5, 0), user(3, 5, 0)];
        let result = calculate(&users, &requirements);

        let presence: i32 = result.matched_skills.iter().map(|m| m.score_contribution).sum();
        assert_eq!(presence, 60);
        assert_eq!(result.match_score, 70);
    }

    #[test]
    fn missing_mandatory_sets_flag() {
        let requirements = vec![req(1, 3, true, 0), req(2, 3, false, 0)];
        let result = calculate(&[user(2, 3, 1)], &requirements);

        assert!(result.mandatory_missing);
        assert_eq!(result.missing_skills.len(), 1);
        assert!(result.missing_skills[0].is_mandatory);
    }

    #[test]
    fn missing_optional_only_does_not_set_flag() {
        let requirements = vec![req(1, 3, true, 0), req(2, 3, false, 0)];
        let result = calculate(&[user(1, 3, 1)], &requirements);
        assert!(!result.mandatory_missing);
    }

    #[test]
    fn partial_level_earns_linear_credit() {
        // 60 * 2/4 = 30 presence, experience ratio 1.0 -> +10
        let result = calculate(&[user(1, 2, 0)], &[req(1, 4, true, 0)]);
        assert_eq!(result.matched_skills[0].score_contribution, 30);
        assert_eq!(result.match_score, 40);
    }

    #[test]
    fn zero_proficiency_earns_nothing_but_counts_experience() {
        let result = calculate(&[user(1, 0, 5)], &[req(1, 1, false, 2)]);
        assert_eq!(result.matched_skills[0].score_contribution, 0);
        assert_eq!(result.match_score, 10);
    }

    #[test]
    fn unrounded_contributions_accumulate() {
        // three optional skills at 10 points each, each user at level 1 of 3 -> 3.333..
        let requirements = vec![req(1, 3, false, 0), req(2, 3, false, 0), req(3, 3, false, 0)];
        let users = vec![user(1, 1, 0), user(2, 1, 0), user(3, 1, 0)];
        let result = calculate(&users, &requirements);

        assert!(result.matched_skills.iter().all(|m| m.score_contribution == 3));
        // 10.0 presence + 10 experience = 20, not 9 + 10
        assert_eq!(result.match_score, 20);
    }

    #[test]
    fn experience_ratio_is_partial_and_clamped() {
        let half = calculate(&[user(1, 5, 1)], &[req(1, 5, true, 2)]);
        assert_eq!(half.match_score, 65);

        let over = calculate(&[user(1, 5, 10)], &[req(1, 5, true, 2)]);
        assert_eq!(over.match_score, 70);

        let none = calculate(&[user(1, 5, 0)], &[req(1, 5, true, 2)]);
        assert_eq!(none.match_score, 60);
    }

    #[test]
    fn duplicate_user_skill_keeps_last_entry() {
        let users = vec![user(1, 1, 0), user(1, 5, 0)];
        let result = calculate(&users, &[req(1, 5, true, 0)]);
        assert_eq!(result.matched_skills[0].score_contribution, 60);
    }

    #[test]
    fn nil_skill_ids_are_ignored() {
        let users = vec![UserSkill {
            skill_id: Uuid::nil(),
            skill_name: "nil".into(),
            proficiency_level: 5,
            years_experience: 5,
        }];
        let requirements = vec![JobRequirement {
            skill_id: Uuid::nil(),
            skill_name: "nil".into(),
            required_level: 3,
            is_mandatory: true,
            required_years: 0,
        }];
        let result = calculate(&users, &requirements);
        assert_eq!(result, MatchResult::default());
    }

    #[test]
    fn matched_skills_list_mandatory_before_optional() {
        let requirements = vec![req(1, 1, false, 0), req(2, 1, true, 0)];
        let result = calculate(&[user(1, 1, 0), user(2, 1, 0)], &requirements);
        let order: Vec<Uuid> = result.matched_skills.iter().map(|m| m.skill_id).collect();
        assert_eq!(order, vec![skill_id(2), skill_id(1)]);
    }

    #[test]
    fn score_stays_within_bounds_for_out_of_range_inputs() {
        for user_level in [-3, 0, 1, 3, 5, 9] {
            for required in [-1, 0, 1, 4, 5, 12] {
                for years in [-2, 0, 1, 7] {
                    let requirements = vec![req(1, required, true, years), req(2, required, false, years)];
                    let users = vec![user(1, user_level, years), user(2, user_level, -years)];
                    let score = calculate(&users, &requirements).match_score;
                    assert!((0..=100).contains(&score), "score {score} out of range");
                }
            }
        }
    }

    #[test]
    fn resolve_uses_overrides_when_present() {
        let spec = RequirementSpec {
            skill_id: skill_id(1),
            skill_name: "Go".into(),
            importance_weight: 2,
            required_level: Some(9),
            is_mandatory: Some(true),
            required_years: Some(-4),
        };
        let resolved = spec.resolve();
        assert_eq!(resolved.required_level, 5);
        assert!(resolved.is_mandatory);
        assert_eq!(resolved.required_years, 0);
    }

    #[test]
    fn resolve_defaults_derive_from_importance() {
        let high = JobRequirement::from_importance(skill_id(1), "Go", 4);
        assert_eq!(high.required_level, 4);
        assert!(high.is_mandatory);
        assert_eq!(high.required_years, 4);

        let low = JobRequirement::from_importance(skill_id(2), "Redis", 0);
        assert_eq!(low.required_level, 1);
        assert!(!low.is_mandatory);
        assert_eq!(low.required_years, 1);
    }

    #[test]
    fn v2_with_explicit_fields_matches_v1() {
        let specs = vec![
            RequirementSpec {
                skill_id: skill_id(1),
                skill_name: "skill-1".into(),
                importance_weight: 2,
                required_level: Some(4),
                is_mandatory: Some(true),
                required_years: Some(2),
            },
            RequirementSpec {
                skill_id: skill_id(2),
                skill_name: "skill-2".into(),
                importance_weight: 5,
                required_level: Some(2),
                is_mandatory: Some(false),
                required_years: Some(0),
            },
        ];
        let v1 = vec![req(1, 4, true, 2), req(2, 2, false, 0)];
        let users = vec![user(1, 3, 1), user(2, 5, 4)];

        assert_eq!(calculate_v2(&users, &specs), calculate(&users, &v1));
    }

    #[test]
    fn v2_default_path_matches_importance_derived_v1() {
        let specs = vec![RequirementSpec {
            skill_id: skill_id(1),
            skill_name: "skill-1".into(),
            importance_weight: 5,
            required_level: None,
            is_mandatory: None,
            required_years: None,
        }];
        let v1 = vec![JobRequirement::from_importance(skill_id(1), "skill-1", 5)];
        let users = vec![user(1, 4, 2)];

        let result = calculate_v2(&users, &specs);
        assert_eq!(result, calculate(&users, &v1));
        // 60 * 4/5 = 48, experience 2/5 * 10 = 4
        assert_eq!(result.match_score, 52);
    }
}
