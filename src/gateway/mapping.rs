use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 客户端可见模型名 → (provider, 上游模型)。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMapping {
    pub request_model: String,
    pub provider_id: String,
    pub upstream_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub provider_id: String,
    pub upstream_model: String,
}

/// 去掉首尾空白并按 request_model 去重（后写覆盖先写），结果按 key 排序。
pub fn normalize(mappings: impl IntoIterator<Item = ModelMapping>) -> Vec<ModelMapping> {
    let mut by_key: BTreeMap<String, ModelMapping> = BTreeMap::new();
    for m in mappings {
        let m = ModelMapping {
            request_model: m.request_model.trim().to_string(),
            provider_id: m.provider_id.trim().to_string(),
            upstream_model: m.upstream_model.trim().to_string(),
        };
        by_key.insert(m.request_model.clone(), m);
    }
    by_key.into_values().collect()
}

pub fn resolve(mappings: &[ModelMapping], request_model: &str) -> Option<Route> {
    let key = request_model.trim();
    mappings
        .iter()
        .find(|m| m.request_model == key)
        .map(|m| Route {
            provider_id: m.provider_id.clone(),
            upstream_model: m.upstream_model.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(req: &str, provider: &str, upstream: &str) -> ModelMapping {
        ModelMapping {
            request_model: req.to_string(),
            provider_id: provider.to_string(),
            upstream_model: upstream.to_string(),
        }
    }

    #[test]
    fn last_write_wins_and_keys_are_unique() {
        let out = normalize(vec![
            m("gpt", "openai", "gpt-4o"),
            m(" chat ", "deepseek", "deepseek-chat"),
            m("gpt", "openrouter", "openai/gpt-4o-mini"),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(
            resolve(&out, "gpt"),
            Some(Route {
                provider_id: "openrouter".to_string(),
                upstream_model: "openai/gpt-4o-mini".to_string(),
            })
        );
        assert!(resolve(&out, "chat").is_some());
        assert_eq!(resolve(&out, "claude"), None);
    }
}
