//! Query methods accepted by the `/request` endpoint

use serde::{Deserialize, Serialize};
use strum::VariantNames as _;
use strum_macros::{Display, EnumString, VariantNames};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueryMethod {
    Hover,
    Definitions,
    References,
}

impl QueryMethod {
    /// Wire names of every supported method, in declaration order.
    pub fn supported() -> &'static [&'static str] {
        Self::VARIANTS
    }
}
