// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flavor::FlavorPart;

/// Which flavors of a part must match for the part to be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "ANY_OF")]
    AnyOf,
    #[serde(rename = "ALL_OF")]
    AllOf,
    #[serde(rename = "LATEST")]
    Latest,
}

/// Whether a part must be satisfied at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredType {
    #[serde(rename = "REQUIRED")]
    Required,
    #[serde(rename = "REQUIRED_IF_DEFINED")]
    RequiredIfDefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub match_type: MatchType,
    pub required: RequiredType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorMatchPolicy {
    pub flavor_part: FlavorPart,
    pub match_policy: MatchPolicy,
}

/// A named collection of flavors with one match policy per flavor part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorGroup {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub flavor_match_policies: Vec<FlavorMatchPolicy>,
}

impl FlavorGroup {
    /// The policy for a given part, if the group defines one.
    pub fn match_policy(&self, part: FlavorPart) -> Option<MatchPolicy> {
        self.flavor_match_policies
            .iter()
            .find(|p| p.flavor_part == part)
            .map(|p| p.match_policy)
    }

    /// The stock `automatic` group every registered host joins by default.
    pub fn automatic() -> Self {
        use FlavorPart::*;
        use MatchType::*;
        use RequiredType::*;

        let policy = |flavor_part, match_type, required| FlavorMatchPolicy {
            flavor_part,
            match_policy: MatchPolicy {
                match_type,
                required,
            },
        };
        Self {
            id: Uuid::new_v4(),
            name: "automatic".to_string(),
            flavor_match_policies: vec![
                policy(Platform, AnyOf, Required),
                policy(Os, AnyOf, Required),
                policy(AssetTag, AnyOf, RequiredIfDefined),
                policy(HostUnique, Latest, RequiredIfDefined),
                policy(Software, AllOf, RequiredIfDefined),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_lookup() {
        let group = FlavorGroup::automatic();
        let platform = group.match_policy(FlavorPart::Platform).unwrap();
        assert_eq!(platform.match_type, MatchType::AnyOf);
        assert_eq!(platform.required, RequiredType::Required);

        let host_unique = group.match_policy(FlavorPart::HostUnique).unwrap();
        assert_eq!(host_unique.match_type, MatchType::Latest);
        assert_eq!(host_unique.required, RequiredType::RequiredIfDefined);
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&MatchPolicy {
            match_type: MatchType::AllOf,
            required: RequiredType::RequiredIfDefined,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"match_type":"ALL_OF","required":"REQUIRED_IF_DEFINED"}"#
        );
    }
}
