use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 负载均衡策略（全局配置，不随请求变化）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastUsed,
    Random,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::LeastUsed => "least-used",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least-used" | "leastused" => Ok(Self::LeastUsed),
            "random" => Ok(Self::Random),
            other => Err(format!("未知的负载均衡策略: {other}")),
        }
    }
}
