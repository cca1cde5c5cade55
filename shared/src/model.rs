use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// Remote operation a queued action replays. Closed set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionLabel {
    #[serde(rename = "estimate", alias = "mrv_estimate")]
    Estimate,
    #[serde(rename = "recommend", alias = "recommendations")]
    Recommend,
}

impl ActionLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Estimate => "estimate",
            Self::Recommend => "recommend",
        }
    }
}

impl fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageCode {
    En,
    #[default]
    Hi,
    Mr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropType {
    Wheat,
    Rice,
    Cotton,
    Sugarcane,
    Pulses,
    Millets,
    Other,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrigationType {
    Rainfed,
    Flood,
    Drip,
    Sprinkler,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PracticeType {
    NoTill,
    ReducedTill,
    CoverCrop,
    DripIrrigation,
    OrganicCompost,
    Agroforestry,
    Biochar,
    ResidueRetention,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[default]
    Carbon,
    Yield,
    Cost,
    Water,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmProfile {
    pub farmer_id: String,
    pub state: String,
    pub district: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    pub farm_size_hectares: f64,
    pub crop: CropType,
    pub irrigation_type: IrrigationType,
    #[serde(default = "default_soil_organic_carbon")]
    pub soil_organic_carbon_pct: f64,
    #[serde(default)]
    pub language: LanguageCode,
}

fn default_soil_organic_carbon() -> f64 {
    0.7
}

// Location fields identify a farmer; keep them out of logs.
impl fmt::Debug for FarmProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FarmProfile")
            .field("farmer_id", &self.farmer_id)
            .field("village_present", &self.village.is_some())
            .field("farm_size_hectares", &self.farm_size_hectares)
            .field("crop", &self.crop)
            .field("irrigation_type", &self.irrigation_type)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

/// Payload of a queued `estimate` action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRequest {
    pub profile: FarmProfile,
    #[serde(default = "default_practices")]
    pub practices: Vec<PracticeType>,
}

/// Practices assumed when a queued estimate carries none.
fn default_practices() -> Vec<PracticeType> {
    vec![PracticeType::CoverCrop, PracticeType::ReducedTill]
}

/// Payload of a queued `recommend` action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub profile: FarmProfile,
    #[serde(default)]
    pub objective: Objective,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MrvEstimate {
    pub estimated_annual_co2e_tons: f64,
    pub confidence_score: f64,
    pub mrv_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub explanation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub practice: PracticeType,
    pub impact_score: f64,
    pub rationale: String,
    pub estimated_cost_inr_per_hectare: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub recommendations: Vec<RecommendationItem>,
    pub advisory_note: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn label_accepts_legacy_names() {
        let est: ActionLabel = serde_json::from_value(json!("mrv_estimate")).unwrap();
        let rec: ActionLabel = serde_json::from_value(json!("recommendations")).unwrap();
        assert_eq!(est, ActionLabel::Estimate);
        assert_eq!(rec, ActionLabel::Recommend);
        assert_eq!(serde_json::to_value(est).unwrap(), json!("estimate"));
    }

    #[test]
    fn profile_defaults_match_service() {
        let profile: FarmProfile = serde_json::from_value(json!({
            "farmer_id": "f1",
            "state": "Maharashtra",
            "district": "Pune",
            "farm_size_hectares": 1.5,
            "crop": "wheat",
            "irrigation_type": "rainfed"
        }))
        .unwrap();

        assert_eq!(profile.language, LanguageCode::Hi);
        assert!((profile.soil_organic_carbon_pct - 0.7).abs() < f64::EPSILON);
        assert!(profile.village.is_none());
    }

    #[test]
    fn profile_debug_hides_location() {
        let profile = FarmProfile {
            farmer_id: "f1".into(),
            state: "Maharashtra".into(),
            district: "Pune".into(),
            village: Some("Khed".into()),
            farm_size_hectares: 2.0,
            crop: CropType::Rice,
            irrigation_type: IrrigationType::Drip,
            soil_organic_carbon_pct: 0.9,
            language: LanguageCode::Mr,
        };
        let rendered = format!("{profile:?}");
        assert!(!rendered.contains("Khed"));
        assert!(!rendered.contains("Pune"));
        assert!(rendered.contains("f1"));
    }

    #[test]
    fn objective_defaults_to_carbon() {
        let req: RecommendationRequest = serde_json::from_value(json!({
            "profile": {
                "farmer_id": "f1",
                "state": "s",
                "district": "d",
                "farm_size_hectares": 1.0,
                "crop": "other",
                "irrigation_type": "flood"
            }
        }))
        .unwrap();
        assert_eq!(req.objective, Objective::Carbon);
    }

    #[test]
    fn practices_default_when_missing() {
        let req: EstimateRequest = serde_json::from_value(json!({
            "profile": {
                "farmer_id": "f1",
                "state": "s",
                "district": "d",
                "farm_size_hectares": 1.0,
                "crop": "wheat",
                "irrigation_type": "drip"
            }
        }))
        .unwrap();
        assert_eq!(
            req.practices,
            vec![PracticeType::CoverCrop, PracticeType::ReducedTill]
        );
    }
}
