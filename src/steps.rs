//! The RAI assessment step catalogue.
//!
//! Each step parses its normalized JSON into a typed schema and turns it into
//! a fragment of `##TOKEN` replacements. Schemas are lenient about field
//! types models commonly get wrong (numbers for ids, lists for strings) but a
//! structural mismatch is reported as [`StepDataError`] so the orchestrator
//! can record the degradation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::normalize::Normalized;
use crate::pipeline::{Fragment, GenerationStep, StepProcessor};
use crate::prompts;

/// Provisioned intended-use slots in the templates.
pub const MAX_UNITS: usize = 10;
const MAX_STAKEHOLDERS: usize = 10;
const MAX_SUPPLEMENTARY: usize = 5;
const MAX_FEATURES: usize = 10;
const MAX_HARMS: usize = 10;

const MITIGATION_SEPARATOR: &str = "------------------------\n";

#[derive(Debug, Error)]
pub enum StepDataError {
    #[error("answer does not match the step schema: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("expected a {expected} answer")]
    UnexpectedAnswer { expected: &'static str },
}

/// Intended use published to later prompts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntendedUseRef {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// State shared between steps of one run. Steps only see what earlier steps
/// published.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub intended_uses: Vec<IntendedUseRef>,
    /// `intended_use_NN` to stakeholder names.
    pub stakeholders: BTreeMap<String, Vec<String>>,
    pub populated_units: usize,
}

impl RunState {
    pub fn intended_uses_json(&self) -> String {
        serde_json::to_string(&self.intended_uses).unwrap_or_else(|_| "[]".into())
    }

    pub fn stakeholders_json(&self) -> String {
        serde_json::to_string(&self.stakeholders).unwrap_or_else(|_| "{}".into())
    }

    fn intended_use_name(&self, id: &str) -> Option<&str> {
        self.intended_uses
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.name.as_str())
    }
}

// =============================================================================
// Lenient field helpers
// =============================================================================

/// Accept a string, number, bool or null where a string is expected.
fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    })
}

/// Accept a bool, or the strings "true"/"yes".
fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
        _ => false,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::One(String::new())
    }
}

impl StringOrList {
    fn render(&self) -> String {
        match self {
            StringOrList::One(s) => s.clone(),
            StringOrList::Many(items) => format!("{}\n", items.join("\n")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::Many(items) => items.first(),
            OneOrMany::One(item) => Some(item),
        }
    }
}

/// Slot number of an intended-use id: `"02"`, `2` and `"intended_use_02"`
/// all give 2.
pub fn unit_number(id: &str) -> Option<usize> {
    let digits: String = id
        .trim()
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok().filter(|n| *n > 0)
}

fn nn(n: usize) -> String {
    format!("{n:02}")
}

fn json_answer(answer: &Normalized) -> Result<&Value, StepDataError> {
    match answer {
        Normalized::Json(value) => Ok(value),
        _ => Err(StepDataError::UnexpectedAnswer { expected: "JSON" }),
    }
}

fn section<T: DeserializeOwned>(answer: &Normalized, main_key: &str) -> Result<T, StepDataError> {
    let value = json_answer(answer)?;
    let inner = value.get(main_key).cloned().unwrap_or(Value::Null);
    Ok(serde_json::from_value(inner)?)
}

/// Slot for the entry at `index`, preferring its own id.
fn slot_of(id: &str, index: usize) -> usize {
    unit_number(id).unwrap_or(index + 1)
}

// =============================================================================
// 1. Intended uses
// =============================================================================

#[derive(Debug, Deserialize)]
struct IntendedUse {
    #[serde(default, deserialize_with = "lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    description: String,
}

pub struct IntendedUses;

impl StepProcessor for IntendedUses {
    fn process(&self, answer: &Normalized, state: &mut RunState) -> Result<Fragment, StepDataError> {
        let uses: Vec<IntendedUse> = section(answer, "intendeduses")?;
        let mut fragment = Fragment::new();
        for n in 1..=MAX_UNITS {
            let (name, description) = uses
                .get(n - 1)
                .map(|u| (u.name.clone(), u.description.clone()))
                .unwrap_or_default();
            fragment.insert(format!("##INTENDED_USE_NAME_{}", nn(n)), name.clone());
            fragment.insert(format!("##INTENDED_USE_{}", nn(n)), name);
            fragment.insert(format!("##INTENDED_USE_DESCRIPTION_{}", nn(n)), description);
        }

        if uses.len() > MAX_UNITS {
            tracing::warn!(
                found = uses.len(),
                kept = MAX_UNITS,
                "more intended uses than template slots"
            );
        }
        state.intended_uses = uses
            .into_iter()
            .take(MAX_UNITS)
            .enumerate()
            .map(|(i, u)| IntendedUseRef {
                id: nn(i + 1),
                name: u.name,
                description: u.description,
            })
            .collect();
        state.populated_units = state.intended_uses.len();
        Ok(fragment)
    }
}

// =============================================================================
// 2. Solution scope
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolutionScope {
    #[serde(deserialize_with = "lenient_string")]
    current_deployment_location: String,
    #[serde(deserialize_with = "lenient_string")]
    upcoming_release_deployment_locations: String,
    #[serde(deserialize_with = "lenient_string")]
    future_deployment_locations: String,
    #[serde(deserialize_with = "lenient_string")]
    current_supported_languages: String,
    #[serde(deserialize_with = "lenient_string")]
    upcoming_release_supported_languages: String,
    #[serde(deserialize_with = "lenient_string")]
    future_supported_languages: String,
    #[serde(deserialize_with = "lenient_string")]
    current_solution_deployment_method: String,
    #[serde(deserialize_with = "lenient_string")]
    upcoming_release_solution_deployment_method: String,
    #[serde(deserialize_with = "lenient_string")]
    cloud_platform: String,
    #[serde(deserialize_with = "lenient_string")]
    data_requirements: String,
    #[serde(deserialize_with = "lenient_string")]
    existing_data_sets: String,
}

pub struct SolutionScopeStep;

impl StepProcessor for SolutionScopeStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let s: SolutionScope = section(answer, "solutionscope")?;
        Ok(Fragment::from([
            ("##CURRENT_DEPLOYMENT_LOCATION".into(), s.current_deployment_location),
            ("##UPCOMING_RELEASE_DEPLOYMENT_LOCATIONS".into(), s.upcoming_release_deployment_locations),
            ("##FUTURE_DEPLOYMENT_LOCATIONS".into(), s.future_deployment_locations),
            ("##CURRENT_SUPPORTED_LANGUAGES".into(), s.current_supported_languages),
            ("##UPCOMING_RELEASE_SUPPORTED_LANGUAGES".into(), s.upcoming_release_supported_languages),
            ("##FUTURE_SUPPORTED_LANGUAGES".into(), s.future_supported_languages),
            ("##CURRENT_SOLUTION_DEPLOYMENT_METHOD".into(), s.current_solution_deployment_method),
            (
                "##UPCOMING_RELEASE_SOLUTION_DEPLOYMENT_METHOD".into(),
                s.upcoming_release_solution_deployment_method,
            ),
            ("##CLOUD_PLATFORM".into(), s.cloud_platform),
            ("##DATA_REQUIREMENTS".into(), s.data_requirements),
            ("##EXISTING_DATA_SETS".into(), s.existing_data_sets),
        ]))
    }
}

// =============================================================================
// 3. Solution information
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SupplementaryInformation {
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(deserialize_with = "lenient_string")]
    link: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolutionInformation {
    #[serde(deserialize_with = "lenient_string")]
    solution_name: String,
    #[serde(deserialize_with = "lenient_string")]
    solution_purpose: String,
    supplementary_informations: Vec<SupplementaryInformation>,
    existing_features: Vec<String>,
    upcoming_features: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    solution_relations: String,
}

/// Value for an unfilled slot: the first slot of an empty list reads `None`.
fn empty_slot(n: usize, list_len: usize) -> String {
    if n == 1 && list_len == 0 {
        "None".into()
    } else {
        String::new()
    }
}

pub struct SolutionInformationStep;

impl StepProcessor for SolutionInformationStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let info: SolutionInformation = section(answer, "solution_information")?;
        let mut fragment = Fragment::new();
        fragment.insert("##SOLUTION_NAME".into(), info.solution_name);
        fragment.insert("##SOLUTION_PURPOSE".into(), info.solution_purpose);

        let supp = &info.supplementary_informations;
        for n in 1..=MAX_SUPPLEMENTARY {
            let (name, link) = match supp.get(n - 1) {
                Some(s) => (s.name.clone(), s.link.clone()),
                None => (empty_slot(n, supp.len()), empty_slot(n, supp.len())),
            };
            fragment.insert(format!("##SUPPLEMENTARY_INFORMATION_{}", nn(n)), name);
            fragment.insert(format!("##SUPPLEMENTARY_INFORMATION_LINK_{}", nn(n)), link);
        }

        for (prefix, list) in [
            ("##EXISTING_FEATURE_", &info.existing_features),
            ("##UPCOMING_FEATURE_", &info.upcoming_features),
        ] {
            for n in 1..=MAX_FEATURES {
                let value = list
                    .get(n - 1)
                    .cloned()
                    .unwrap_or_else(|| empty_slot(n, list.len()));
                fragment.insert(format!("{prefix}{}", nn(n)), value);
            }
        }

        fragment.insert("##RELATION_TO_OTHER_FEATURES".into(), info.solution_relations);
        Ok(fragment)
    }
}

// =============================================================================
// 4. Fitness for purpose
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FitnessForPurpose {
    #[serde(deserialize_with = "lenient_string")]
    intendeduse_id: String,
    #[serde(deserialize_with = "lenient_string")]
    fitness_for_purpose: String,
}

pub struct FitnessForPurposeStep;

impl StepProcessor for FitnessForPurposeStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let entries: Vec<FitnessForPurpose> = section(answer, "fitnessforpurpose")?;
        let mut fragment: Fragment = (1..=MAX_UNITS)
            .map(|n| (format!("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU{}", nn(n)), String::new()))
            .collect();
        for (i, entry) in entries.into_iter().enumerate() {
            let slot = slot_of(&entry.intendeduse_id, i);
            if slot <= MAX_UNITS {
                fragment.insert(
                    format!("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU{}", nn(slot)),
                    entry.fitness_for_purpose,
                );
            }
        }
        Ok(fragment)
    }
}

// =============================================================================
// 5. Stakeholders
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Stakeholder {
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(deserialize_with = "lenient_string")]
    potential_solution_benefits: String,
    #[serde(deserialize_with = "lenient_string")]
    potential_solution_harms: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IntendedUseStakeholders {
    #[serde(deserialize_with = "lenient_string")]
    intendeduse_id: String,
    #[serde(rename = "StakeHolders")]
    stakeholders: Vec<Stakeholder>,
}

pub struct StakeholdersStep;

impl StepProcessor for StakeholdersStep {
    fn process(&self, answer: &Normalized, state: &mut RunState) -> Result<Fragment, StepDataError> {
        let entries: Vec<IntendedUseStakeholders> = section(answer, "intendeduse_stakeholder")?;
        let mut by_unit: BTreeMap<usize, Vec<Stakeholder>> = BTreeMap::new();
        for (i, entry) in entries.into_iter().enumerate() {
            by_unit
                .entry(slot_of(&entry.intendeduse_id, i))
                .or_insert(entry.stakeholders);
        }

        let mut fragment = Fragment::new();
        for unit in 1..=MAX_UNITS {
            let list = by_unit.get(&unit).map(Vec::as_slice).unwrap_or_default();
            if !list.is_empty() {
                state.stakeholders.insert(
                    format!("intended_use_{}", nn(unit)),
                    list.iter().map(|s| s.name.clone()).collect(),
                );
            }
            for s in 1..=MAX_STAKEHOLDERS {
                let (name, benefits, harms) = list
                    .get(s - 1)
                    .map(|st| {
                        (
                            st.name.clone(),
                            st.potential_solution_benefits.clone(),
                            st.potential_solution_harms.clone(),
                        )
                    })
                    .unwrap_or_default();
                let suffix = format!("{}_IU{}", nn(s), nn(unit));
                fragment.insert(format!("##STAKEHOLDER_{suffix}"), name);
                fragment.insert(format!("##STAKEHOLDER_BENEFITS_{suffix}"), benefits);
                fragment.insert(format!("##STAKEHOLDER_HARMS_{suffix}"), harms);
            }
        }
        Ok(fragment)
    }
}

// =============================================================================
// 6-7. Goal questionnaires
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GoalAnswer {
    #[serde(deserialize_with = "lenient_string")]
    question_id: String,
    #[serde(deserialize_with = "lenient_string")]
    detailed_answer: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IntendedUseAnswers {
    #[serde(deserialize_with = "lenient_string")]
    intendeduse_id: String,
    answers: Vec<GoalAnswer>,
}

pub const GOALS_A5_T3_TOKENS: &[(&str, &str)] = &[
    ("GOAL_A5_Q1", "##HUMAN_OVERSIGHT_IU"),
    ("GOAL_A5_Q2", "##HUMAN_RESPONSIBILITIES_IU"),
    ("GOAL_T1_Q1", "##DECISIONMAKING_OUTPUTS_IU"),
    ("GOAL_T1_Q2", "##DECISIONMAKING_MADE_IU"),
    ("GOAL_T2_Q1", "##DECISIONMAKING_STAKEHOLDERS_IU"),
    ("GOAL_T2_Q2", "##DEVELOPDEPLOY_SOLUTION_IU"),
    ("GOAL_T3_Q1", "##DISCLOSURE_AND_AI_INTERACTION_IU"),
];

// PIORITIZED matches the shipped templates.
pub const FAIRNESS_TOKENS: &[(&str, &str)] = &[
    ("GOAL_F1_Q1", "##QUALITYOFSERVICE_STAKEHOLDERS_IU"),
    ("GOAL_F1_Q2", "##QUALITYOFSERVICE_PIORITIZED_IU"),
    ("GOAL_F1_Q3", "##QUALITYOFSERVICE_AFFECTED_IU"),
    ("GOAL_F2_Q1", "##ALLOCATION_STAKEHOLDERS_IU"),
    ("GOAL_F2_Q2", "##ALLOCATION_PRIORITIZED_IU"),
    ("GOAL_F2_Q3", "##ALLOCATION_AFFECTED_IU"),
    ("GOAL_F3_Q1", "##MINIMIZATION_STAKEHOLDERS_IU"),
    ("GOAL_F3_Q2", "##MINIMIZATION_PRIORITIZED_IU"),
    ("GOAL_F3_Q3", "##MINIMIZATION_AFFECTED_IU"),
];

/// Per-intended-use questionnaire mapped onto token prefixes.
pub struct GoalQuestions {
    pub main_key: &'static str,
    pub tokens: &'static [(&'static str, &'static str)],
    /// Value for a question with no answer.
    pub missing: &'static str,
}

impl StepProcessor for GoalQuestions {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let entries: Vec<IntendedUseAnswers> = section(answer, self.main_key)?;
        let mut by_unit: BTreeMap<usize, Vec<GoalAnswer>> = BTreeMap::new();
        for (i, entry) in entries.into_iter().enumerate() {
            by_unit
                .entry(slot_of(&entry.intendeduse_id, i))
                .or_insert(entry.answers);
        }

        let mut fragment = Fragment::new();
        for unit in 1..=MAX_UNITS {
            let answers = by_unit.get(&unit).map(Vec::as_slice).unwrap_or_default();
            for (question, prefix) in self.tokens {
                let value = answers
                    .iter()
                    .find(|a| a.question_id.trim().eq_ignore_ascii_case(question))
                    .map(|a| a.detailed_answer.clone())
                    .unwrap_or_else(|| self.missing.to_string());
                fragment.insert(format!("{prefix}{}", nn(unit)), value);
            }
        }
        Ok(fragment)
    }
}

// =============================================================================
// 8. Solution assessment
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Assessment {
    #[serde(deserialize_with = "lenient_string")]
    technology_readiness_id: String,
    #[serde(deserialize_with = "lenient_string")]
    task_complexity_id: String,
    #[serde(deserialize_with = "lenient_string")]
    role_of_humans_id: String,
    #[serde(deserialize_with = "lenient_string")]
    deployment_environment_complexity_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IntendedUseAssessment {
    #[serde(deserialize_with = "lenient_string")]
    intendeduse_id: String,
    assessment: OneOrMany<Assessment>,
}

/// Option number of an answer like `TASK_COMPLEXITY_2`, zero-padded.
fn selected_option(answer: &str) -> String {
    let suffix = answer.rsplit('_').next().unwrap_or_default().trim();
    match suffix.parse::<usize>() {
        Ok(n) => nn(n),
        Err(_) => suffix.to_string(),
    }
}

pub struct SolutionAssessmentStep;

impl StepProcessor for SolutionAssessmentStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let entries: Vec<IntendedUseAssessment> = section(answer, "intendeduse_assessment")?;
        let mut fragment = Fragment::new();
        for (i, entry) in entries.iter().enumerate() {
            let unit = nn(slot_of(&entry.intendeduse_id, i));
            let picks = entry.assessment.first().map(|a| {
                [
                    selected_option(&a.technology_readiness_id),
                    selected_option(&a.task_complexity_id),
                    selected_option(&a.role_of_humans_id),
                    selected_option(&a.deployment_environment_complexity_id),
                ]
            });
            let groups = [
                ("##TECH_ASSESSMENT_", 5),
                ("##TASK_COMPLEXITY_", 3),
                ("##ROLE_OF_HUMAN_", 5),
                ("##DEPLOYMENT_COMPLEXITY_", 3),
            ];
            for (g, (prefix, options)) in groups.iter().enumerate() {
                let selected = picks.as_ref().map(|p| p[g].as_str()).unwrap_or_default();
                for k in 1..=*options {
                    let mark = if nn(k) == selected { "X" } else { "" };
                    fragment.insert(format!("{prefix}{}_IU{unit}", nn(k)), mark.to_string());
                }
            }
        }
        Ok(fragment)
    }
}

// =============================================================================
// 9. Risks of use
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RisksOfUse {
    restricted_uses: StringOrList,
    unsupported_uses: StringOrList,
    #[serde(deserialize_with = "lenient_string")]
    known_limitations: String,
    #[serde(deserialize_with = "lenient_string")]
    potential_impact_of_failure_on_stakeholders: String,
    #[serde(deserialize_with = "lenient_string")]
    potential_impact_of_misuse_on_stakeholders: String,
    #[serde(deserialize_with = "lenient_bool")]
    sensitive_use_1: bool,
    #[serde(deserialize_with = "lenient_bool")]
    sensitive_use_2: bool,
    #[serde(deserialize_with = "lenient_bool")]
    sensitive_use_3: bool,
}

fn yes_no(flag: bool) -> String {
    if flag { "  Yes" } else { "  No" }.to_string()
}

pub struct RisksOfUseStep;

impl StepProcessor for RisksOfUseStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let r: RisksOfUse = section(answer, "risksofuse")?;
        // The stakeholder impact step refines these two, so the token stays in
        // the text as the refinement anchor.
        Ok(Fragment::from([
            ("##RESTRICTED_USES".into(), r.restricted_uses.render()),
            ("##UNSUPPORTED_USES".into(), r.unsupported_uses.render()),
            ("##KNOWN_LIMITATIONS".into(), r.known_limitations),
            (
                "##FAILURE_ON_STAKEHOLDERS".into(),
                format!("{}\n\n##FAILURE_ON_STAKEHOLDERS", r.potential_impact_of_failure_on_stakeholders),
            ),
            (
                "##MISUSE_ON_STAKEHOLDERS".into(),
                format!("{}\n\n##MISUSE_ON_STAKEHOLDERS", r.potential_impact_of_misuse_on_stakeholders),
            ),
            ("##SENSITIVE_USE_01".into(), yes_no(r.sensitive_use_1)),
            ("##SENSITIVE_USE_02".into(), yes_no(r.sensitive_use_2)),
            ("##SENSITIVE_USE_03".into(), yes_no(r.sensitive_use_3)),
        ]))
    }
}

// =============================================================================
// 10. Impact on stakeholders
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StakeholdersImpact {
    #[serde(deserialize_with = "lenient_string")]
    potential_impact_of_failure_on_stakeholders: String,
    #[serde(deserialize_with = "lenient_string")]
    potential_impact_of_misuse_on_stakeholders: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImpactOnStakeholders {
    #[serde(deserialize_with = "lenient_string")]
    intendeduse_id: String,
    impact_on_stakeholders: OneOrMany<StakeholdersImpact>,
}

pub struct ImpactOnStakeholdersStep;

impl StepProcessor for ImpactOnStakeholdersStep {
    fn process(&self, answer: &Normalized, state: &mut RunState) -> Result<Fragment, StepDataError> {
        let entries: Vec<ImpactOnStakeholders> = section(answer, "intendeduse_impactonstakeholders")?;
        let mut failures = Vec::new();
        let mut misuses = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let Some(impact) = entry.impact_on_stakeholders.first() else {
                continue;
            };
            let id = nn(slot_of(&entry.intendeduse_id, i));
            let label = state
                .intended_use_name(&id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Intended use #{}", id.trim_start_matches('0')));
            failures.push(format!("{label}:\n{}", impact.potential_impact_of_failure_on_stakeholders));
            misuses.push(format!("{label}:\n{}", impact.potential_impact_of_misuse_on_stakeholders));
        }
        Ok(Fragment::from([
            ("##FAILURE_ON_STAKEHOLDERS".into(), failures.join("\n\n")),
            ("##MISUSE_ON_STAKEHOLDERS".into(), misuses.join("\n\n")),
        ]))
    }
}

// =============================================================================
// 11. Harms assessment
// =============================================================================

/// Mitigation guidance for harm questions Q1..Q13, in question order.
pub const HARM_MITIGATIONS: [&str; 13] = [
    "Goal A2: Oversight of significant adverse impacts\n\
     Harms arising from sensitive uses are mitigated with guidance from the sensitive uses review team; report the system as a sensitive use. Restricted uses follow their own guidance.\n",
    "Goal A3: Fit for purpose\n\
     Mitigated by providing evidence that the system is fit for purpose for this intended use, accepting that the problem may have several valid solutions.\n",
    "Goal A4: Data governance and management\n\
     Mitigated by making sure training data is processed correctly and suits the intended uses, stakeholders and deployment geographies.\n",
    "Goal A5: Human oversight and control\n\
     Mitigated by adapting system elements (UX, features, training material) so the responsible stakeholders understand and can carry out their oversight duties.\n",
    "Goal T1: System intelligibility for decision making\n\
     Applies when outputs inform decisions by or about people. Mitigated by adapting system elements so affected stakeholders can interpret system behaviour.\n",
    "Goal T2: Communication to stakeholders\n\
     Mitigated by giving stakeholders the information they need to decide when to use the system.\n",
    "Goal T3: Disclosure of AI interaction\n\
     Applies to systems that imitate human interaction or produce media that could pass as authentic. Mitigated by adapting system elements so people know they are dealing with AI or AI-generated content.\n",
    "Goal F1: Quality of service\n\
     Applies when demographic groups may get different quality of service that a different design could remedy. Mitigated by evaluating data and system, then improving performance for affected groups while narrowing gaps between groups.\n",
    "Goal F2: Allocation of resources and opportunities\n\
     Applies when outputs affect finance, education, employment, healthcare, housing, insurance or social welfare. Mitigated by evaluating data and system, then narrowing allocation differences between groups.\n",
    "Goal F3: Minimization of stereotyping, demeaning, and erasing outputs\n\
     Applies when outputs represent people, cultures or society. Mitigated by understanding how groups are represented and adapting the system to minimise harmful outputs.\n",
    "Goal RS1: Reliability and safety guidance\n\
     Mitigated by defining safe and reliable behaviour, covering key intended uses in data sets, defining operational factors and ranges, and communicating reliability information to stakeholders.\n",
    "Goal RS2: Failures and remediations\n\
     Mitigated by a failure management approach for each predictable failure.\n",
    "Goal RS3: Ongoing monitoring, feedback, and evaluation\n\
     Mitigated by monitoring that lets the team spot new uses, troubleshoot issues, maintain the system and improve it over time.\n",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Harm {
    #[serde(deserialize_with = "lenient_string")]
    identified_harm: String,
    #[serde(deserialize_with = "lenient_string")]
    corresponding_goals: String,
    assessment: BTreeMap<String, Value>,
}

impl Harm {
    fn answered(&self, question: usize) -> bool {
        let key = format!("Q{question}");
        self.assessment
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .map(|(_, v)| match v {
                Value::Bool(b) => *b,
                Value::String(s) => s.eq_ignore_ascii_case("true"),
                _ => false,
            })
            .unwrap_or(false)
    }

    fn mitigation(&self) -> String {
        let parts: Vec<&str> = HARM_MITIGATIONS
            .iter()
            .enumerate()
            .filter(|(i, _)| self.answered(i + 1))
            .map(|(_, text)| *text)
            .collect();
        parts.join(MITIGATION_SEPARATOR)
    }
}

pub struct HarmsAssessmentStep;

impl StepProcessor for HarmsAssessmentStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let harms: Vec<Harm> = section(answer, "harms_assessment")?;
        let mut fragment = Fragment::new();
        for n in 1..=MAX_HARMS {
            let (harm, goal, mitigation) = harms
                .get(n - 1)
                .map(|h| (h.identified_harm.clone(), h.corresponding_goals.clone(), h.mitigation()))
                .unwrap_or_default();
            fragment.insert(format!("##HARM_{}", nn(n)), harm);
            fragment.insert(format!("##HARM_{}_GOAL", nn(n)), goal);
            fragment.insert(format!("##HARM_{}_MITIGATION", nn(n)), mitigation);
        }
        Ok(fragment)
    }
}

// =============================================================================
// 12. Disclosure of AI interaction
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Disclosure {
    #[serde(deserialize_with = "lenient_bool")]
    disclosure_of_ai_interaction_applies: bool,
    #[serde(deserialize_with = "lenient_string")]
    explanation: String,
}

pub struct DisclosureStep;

impl StepProcessor for DisclosureStep {
    fn process(&self, answer: &Normalized, _state: &mut RunState) -> Result<Fragment, StepDataError> {
        let d: Disclosure = section(answer, "disclosureofaiinteraction")?;
        Ok(Fragment::from([
            ("##DISCLOSURE_OF_AI_INTERACTION".into(), yes_no(d.disclosure_of_ai_interaction_applies)),
            ("##DISCLOSURE_OF_AI_INTERACTION_EXPLANATION".into(), d.explanation),
        ]))
    }
}

// =============================================================================
// Security audit
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityFindings {
    pub identified_bias: Vec<String>,
    pub identified_prompt_commands: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub rewritten_solution_description: String,
}

impl SecurityFindings {
    pub fn from_answer(answer: &Normalized) -> Result<Self, StepDataError> {
        section(answer, "solutionassessment")
    }

    /// Markdown report: bias findings first, then prompt-command risks.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        if !self.identified_bias.is_empty() {
            out.push_str("### Potential bias in the solution description\n");
            for item in &self.identified_bias {
                out.push_str(&format!("\n- {item}"));
            }
            out.push_str("\n\n");
        }
        if !self.identified_prompt_commands.is_empty() {
            out.push_str("### Potential risks in the solution description\n");
            for item in &self.identified_prompt_commands {
                out.push_str(&format!("\n- {item}"));
            }
            out.push_str("\n\n");
        }
        out
    }
}

// =============================================================================
// Catalogue
// =============================================================================

/// The twelve assessment steps in execution order.
pub fn rai_steps() -> Vec<GenerationStep> {
    vec![
        GenerationStep::json("Intended Uses", prompts::INTENDED_USES_PROMPT, "intendeduses", 0.1, Arc::new(IntendedUses))
            .publishes_units(),
        GenerationStep::json("Solution Scope", prompts::SOLUTION_SCOPE_PROMPT, "solutionscope", 0.1, Arc::new(SolutionScopeStep))
            .requires_units(),
        GenerationStep::json(
            "Solution Information",
            prompts::SOLUTION_INFORMATION_PROMPT,
            "solution_information",
            0.1,
            Arc::new(SolutionInformationStep),
        )
        .requires_units(),
        GenerationStep::json(
            "Fitness for Purpose",
            prompts::FITNESS_FOR_PURPOSE_PROMPT,
            "fitnessforpurpose",
            0.2,
            Arc::new(FitnessForPurposeStep),
        )
        .depends_on(&["Intended Uses"])
        .requires_units(),
        GenerationStep::json(
            "Stakeholders",
            prompts::STAKEHOLDERS_PROMPT,
            "intendeduse_stakeholder",
            0.4,
            Arc::new(StakeholdersStep),
        )
        .depends_on(&["Intended Uses"])
        .requires_units(),
        GenerationStep::json(
            "Goals A5 and T3",
            prompts::GOALS_A5_T3_PROMPT,
            "intendeduse_answers",
            0.2,
            Arc::new(GoalQuestions {
                main_key: "intendeduse_answers",
                tokens: GOALS_A5_T3_TOKENS,
                missing: "",
            }),
        )
        .depends_on(&["Intended Uses"])
        .requires_units(),
        GenerationStep::json(
            "Fairness Goals",
            prompts::GOALS_FAIRNESS_PROMPT,
            "intendeduse_fairness_answers",
            0.1,
            Arc::new(GoalQuestions {
                main_key: "intendeduse_fairness_answers",
                tokens: FAIRNESS_TOKENS,
                missing: "N/A",
            }),
        )
        .depends_on(&["Intended Uses", "Stakeholders"])
        .requires_units(),
        GenerationStep::json(
            "Solution Assessment",
            prompts::SOLUTION_ASSESSMENT_PROMPT,
            "intendeduse_assessment",
            0.1,
            Arc::new(SolutionAssessmentStep),
        )
        .depends_on(&["Intended Uses"])
        .requires_units(),
        GenerationStep::json("Risks of Use", prompts::RISKS_OF_USE_PROMPT, "risksofuse", 0.1, Arc::new(RisksOfUseStep))
            .requires_units(),
        GenerationStep::json(
            "Impact on Stakeholders",
            prompts::IMPACT_ON_STAKEHOLDERS_PROMPT,
            "intendeduse_impactonstakeholders",
            0.3,
            Arc::new(ImpactOnStakeholdersStep),
        )
        .depends_on(&["Intended Uses", "Stakeholders", "Risks of Use"])
        .requires_units(),
        GenerationStep::json(
            "Harms Assessment",
            prompts::HARMS_ASSESSMENT_PROMPT,
            "harms_assessment",
            0.1,
            Arc::new(HarmsAssessmentStep),
        )
        .requires_units(),
        GenerationStep::json(
            "Disclosure of AI Interaction",
            prompts::DISCLOSURE_PROMPT,
            "disclosureofaiinteraction",
            0.1,
            Arc::new(DisclosureStep),
        )
        .requires_units(),
    ]
}

/// Temperature of the description feedback step.
pub const ANALYSIS_TEMPERATURE: f32 = 0.4;
/// Temperature of the description audit step.
pub const AUDIT_TEMPERATURE: f32 = 0.1;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(p: &dyn StepProcessor, value: Value, state: &mut RunState) -> Fragment {
        p.process(&Normalized::Json(value), state).unwrap()
    }

    #[test]
    fn test_unit_number() {
        assert_eq!(unit_number("02"), Some(2));
        assert_eq!(unit_number("intended_use_10"), Some(10));
        assert_eq!(unit_number("3"), Some(3));
        assert_eq!(unit_number("none"), None);
        assert_eq!(unit_number("00"), None);
    }

    #[test]
    fn test_intended_uses_publish_units() {
        let mut state = RunState::default();
        let fragment = run(
            &IntendedUses,
            json!({"intendeduses": [
                {"name": "Triage", "description": "Rank referrals"},
                {"name": "Summaries", "description": "Summarise notes"}
            ]}),
            &mut state,
        );
        assert_eq!(fragment["##INTENDED_USE_NAME_01"], "Triage");
        assert_eq!(fragment["##INTENDED_USE_02"], "Summaries");
        assert_eq!(fragment["##INTENDED_USE_DESCRIPTION_03"], "");
        assert_eq!(fragment.len(), 30);
        assert_eq!(state.populated_units, 2);
        assert_eq!(state.intended_uses[1].id, "02");
        assert!(state.intended_uses_json().contains(r#""id":"01""#));
    }

    #[test]
    fn test_intended_uses_capped() {
        let uses: Vec<Value> = (0..12).map(|i| json!({"name": format!("u{i}"), "description": ""})).collect();
        let mut state = RunState::default();
        run(&IntendedUses, json!({"intendeduses": uses}), &mut state);
        assert_eq!(state.populated_units, MAX_UNITS);
    }

    #[test]
    fn test_schema_mismatch_is_error() {
        let mut state = RunState::default();
        let err = IntendedUses
            .process(&Normalized::Json(json!({"intendeduses": "nope"})), &mut state)
            .unwrap_err();
        assert!(matches!(err, StepDataError::Schema(_)));
        let err = IntendedUses
            .process(&Normalized::Text("x".into()), &mut state)
            .unwrap_err();
        assert!(matches!(err, StepDataError::UnexpectedAnswer { .. }));
    }

    #[test]
    fn test_solution_information_none_slots() {
        let mut state = RunState::default();
        let fragment = run(
            &SolutionInformationStep,
            json!({"solution_information": {
                "solution_name": "Scribe",
                "solution_purpose": "Notes",
                "supplementary_informations": [],
                "existing_features": ["Dictation"],
                "upcoming_features": [],
                "solution_relations": "Standalone"
            }}),
            &mut state,
        );
        assert_eq!(fragment["##SUPPLEMENTARY_INFORMATION_01"], "None");
        assert_eq!(fragment["##SUPPLEMENTARY_INFORMATION_LINK_02"], "");
        assert_eq!(fragment["##EXISTING_FEATURE_01"], "Dictation");
        assert_eq!(fragment["##EXISTING_FEATURE_02"], "");
        assert_eq!(fragment["##UPCOMING_FEATURE_01"], "None");
    }

    #[test]
    fn test_stakeholders_publish_names() {
        let mut state = RunState::default();
        let fragment = run(
            &StakeholdersStep,
            json!({"intendeduse_stakeholder": [
                {"intendeduse_id": "02", "StakeHolders": [
                    {"name": "Nurses", "potential_solution_benefits": "Time", "potential_solution_harms": "Errors"}
                ]}
            ]}),
            &mut state,
        );
        assert_eq!(fragment["##STAKEHOLDER_01_IU02"], "Nurses");
        assert_eq!(fragment["##STAKEHOLDER_HARMS_01_IU02"], "Errors");
        assert_eq!(fragment["##STAKEHOLDER_01_IU01"], "");
        assert_eq!(state.stakeholders["intended_use_02"], vec!["Nurses".to_string()]);
        assert!(!state.stakeholders.contains_key("intended_use_01"));
    }

    #[test]
    fn test_goal_questions_missing_values() {
        let fairness = GoalQuestions {
            main_key: "intendeduse_fairness_answers",
            tokens: FAIRNESS_TOKENS,
            missing: "N/A",
        };
        let mut state = RunState::default();
        let fragment = run(
            &fairness,
            json!({"intendeduse_fairness_answers": [
                {"intendeduse_id": 1, "answers": [
                    {"question_id": "GOAL_F1_Q1", "detailed_answer": "Patients"}
                ]}
            ]}),
            &mut state,
        );
        assert_eq!(fragment["##QUALITYOFSERVICE_STAKEHOLDERS_IU01"], "Patients");
        assert_eq!(fragment["##QUALITYOFSERVICE_PIORITIZED_IU01"], "N/A");
        assert_eq!(fragment["##MINIMIZATION_AFFECTED_IU10"], "N/A");
    }

    #[test]
    fn test_assessment_marks_selected_option() {
        let mut state = RunState::default();
        let fragment = run(
            &SolutionAssessmentStep,
            json!({"intendeduse_assessment": [
                {"intendeduse_id": "01", "assessment": {
                    "technology_readiness_id": "TECHNOLOGY_READINESS_4",
                    "task_complexity_id": "TASK_COMPLEXITY_2",
                    "role_of_humans_id": "ROLE_OF_HUMANS_5",
                    "deployment_environment_complexity_id": "DEPLOYMENT_ENVIRONMENT_COMPLEXITY_1"
                }}
            ]}),
            &mut state,
        );
        assert_eq!(fragment["##TECH_ASSESSMENT_04_IU01"], "X");
        assert_eq!(fragment["##TECH_ASSESSMENT_03_IU01"], "");
        assert_eq!(fragment["##TASK_COMPLEXITY_02_IU01"], "X");
        assert_eq!(fragment["##ROLE_OF_HUMAN_05_IU01"], "X");
        assert_eq!(fragment["##DEPLOYMENT_COMPLEXITY_01_IU01"], "X");
        assert_eq!(fragment.len(), 16);
    }

    #[test]
    fn test_risks_of_use_lists_and_anchor() {
        let mut state = RunState::default();
        let fragment = run(
            &RisksOfUseStep,
            json!({"risksofuse": {
                "restricted_uses": ["None", "Also none"],
                "unsupported_uses": "Legal advice",
                "known_limitations": "Accents",
                "potential_impact_of_failure_on_stakeholders": "Delays",
                "potential_impact_of_misuse_on_stakeholders": "Leaks",
                "sensitive_use_1": true,
                "sensitive_use_2": false,
                "sensitive_use_3": "yes"
            }}),
            &mut state,
        );
        assert_eq!(fragment["##RESTRICTED_USES"], "None\nAlso none\n");
        assert_eq!(fragment["##UNSUPPORTED_USES"], "Legal advice");
        assert_eq!(fragment["##FAILURE_ON_STAKEHOLDERS"], "Delays\n\n##FAILURE_ON_STAKEHOLDERS");
        assert_eq!(fragment["##SENSITIVE_USE_01"], "  Yes");
        assert_eq!(fragment["##SENSITIVE_USE_02"], "  No");
        assert_eq!(fragment["##SENSITIVE_USE_03"], "  Yes");
    }

    #[test]
    fn test_impact_uses_intended_use_names() {
        let mut state = RunState {
            intended_uses: vec![IntendedUseRef {
                id: "02".into(),
                name: "Summaries".into(),
                description: String::new(),
            }],
            ..RunState::default()
        };
        let fragment = run(
            &ImpactOnStakeholdersStep,
            json!({"intendeduse_impactonstakeholders": [
                {"intendeduse_id": "intended_use_02", "impact_on_stakeholders": [
                    {"potential_impact_of_failure_on_stakeholders": "Wrong summary",
                     "potential_impact_of_misuse_on_stakeholders": "Surveillance"}
                ]}
            ]}),
            &mut state,
        );
        assert_eq!(fragment["##FAILURE_ON_STAKEHOLDERS"], "Summaries:\nWrong summary");
        assert_eq!(fragment["##MISUSE_ON_STAKEHOLDERS"], "Summaries:\nSurveillance");
    }

    #[test]
    fn test_harm_mitigation_join() {
        let mut state = RunState::default();
        let fragment = run(
            &HarmsAssessmentStep,
            json!({"harms_assessment": [
                {"identified_harm": "Bias", "corresponding_goals": "F1",
                 "assessment": {"Q1": false, "Q2": true, "Q8": true, "Q13": false}}
            ]}),
            &mut state,
        );
        let mitigation = &fragment["##HARM_01_MITIGATION"];
        assert!(mitigation.starts_with("Goal A3"));
        assert!(mitigation.contains(&format!("{MITIGATION_SEPARATOR}Goal F1")));
        assert_eq!(fragment["##HARM_02"], "");
        assert_eq!(fragment["##HARM_10_MITIGATION"], "");
    }

    #[test]
    fn test_security_findings_markdown() {
        let findings = SecurityFindings::from_answer(&Normalized::Json(json!({
            "solutionassessment": {
                "identified_bias": ["loaded wording"],
                "identified_prompt_commands": [],
                "rewritten_solution_description": "neutral"
            }
        })))
        .unwrap();
        let md = findings.to_markdown();
        assert!(md.starts_with("### Potential bias"));
        assert!(!md.contains("Potential risks"));
    }

    #[test]
    fn test_catalogue_order_and_dependencies() {
        let steps = rai_steps();
        assert_eq!(steps.len(), 12);
        assert_eq!(steps[0].name, "Intended Uses");
        assert_eq!(steps[9].name, "Impact on Stakeholders");
        assert!(steps.iter().skip(1).all(|s| s.requires_units));
        assert!(crate::pipeline::Pipeline::new(steps).is_ok());
    }
}
