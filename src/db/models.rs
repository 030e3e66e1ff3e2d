use serde::{Deserialize, Serialize};
use uuid::Uuid;
use sqlx::FromRow;

/// User-authored rule, evaluated by the analysis service.
/// Serialized with the field names the analysis service expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StrategyDefinition {
    pub id: Uuid,
    pub name: String,
    /// `price`, `change`, or an indicator name such as `rsi`
    pub field: String,
    #[serde(rename = "operator")]
    #[sqlx(rename = "operator")]
    pub comparison_operator: String,
    #[serde(rename = "value")]
    #[sqlx(rename = "value")]
    pub threshold: f64,
    #[serde(rename = "signal")]
    #[sqlx(rename = "signal")]
    pub resulting_signal: String,
}
