//! Core type definitions for PlotBot

use serde::{Deserialize, Serialize};
use std::ops::Add;
use uuid::Uuid;

/// Plot size class (the `k` parameter of the plot format)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotSize {
    K25,
    #[default]
    K32,
    K33,
    K34,
    K35,
}

impl PlotSize {
    /// The numeric `k` value passed to plotters
    pub fn k(&self) -> u8 {
        match self {
            Self::K25 => 25,
            Self::K32 => 32,
            Self::K33 => 33,
            Self::K34 => 34,
            Self::K35 => 35,
        }
    }

    /// Approximate size in bytes of a finished plot of this class
    pub fn expected_bytes(&self) -> u64 {
        match self {
            Self::K25 => 644_245_094,
            Self::K32 => 108_877_420_954,
            Self::K33 => 224_197_292_851,
            Self::K34 => 461_494_235_955,
            Self::K35 => 949_295_146_598,
        }
    }
}

impl std::fmt::Display for PlotSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "k{}", self.k())
    }
}

impl std::str::FromStr for PlotSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().trim_start_matches('k') {
            "25" => Ok(Self::K25),
            "32" => Ok(Self::K32),
            "33" => Ok(Self::K33),
            "34" => Ok(Self::K34),
            "35" => Ok(Self::K35),
            _ => Err(format!("Invalid plot size: {}", s)),
        }
    }
}

/// Reference to a registered strategy: a name plus opaque arguments
///
/// Delay policies, drive clearers and progress parsers are all configured
/// this way. The arguments are only interpreted by the selected component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl std::fmt::Display for ComponentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}({})", self.name, self.args.join(", "))
        }
    }
}

/// A delay policy reference
pub type DelayPolicySpec = ComponentSpec;

/// Threads, ram (MiB) and buckets handed to one plotter instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceShare {
    pub threads: u32,
    pub ram: u32,
    pub buckets: u32,
}

impl ResourceShare {
    pub fn new(threads: u32, ram: u32, buckets: u32) -> Self {
        Self {
            threads,
            ram,
            buckets,
        }
    }

    /// A share with any zero component cannot run a plotter
    pub fn is_exhausted(&self) -> bool {
        self.threads == 0 || self.ram == 0 || self.buckets == 0
    }

    /// Split this budget for the next instance of a profile.
    ///
    /// Each component is `budget / (active + 1)`, capped by an even split of
    /// what is left over among the `max_instances - active` free slots, so
    /// the last allowed instance still gets a share.
    pub fn next_share(
        &self,
        max_instances: usize,
        active: usize,
        allocated: ResourceShare,
    ) -> ResourceShare {
        if active >= max_instances {
            return ResourceShare::default();
        }
        let divisor = u32::try_from(active + 1).unwrap_or(u32::MAX);
        let free_slots = u32::try_from(max_instances - active).unwrap_or(u32::MAX);
        let split = |budget: u32, used: u32| {
            (budget / divisor).min(budget.saturating_sub(used) / free_slots)
        };

        ResourceShare {
            threads: split(self.threads, allocated.threads),
            ram: split(self.ram, allocated.ram),
            buckets: split(self.buckets, allocated.buckets),
        }
    }

    /// True when every component fits within `budget`
    pub fn fits_within(&self, budget: &ResourceShare) -> bool {
        self.threads <= budget.threads && self.ram <= budget.ram && self.buckets <= budget.buckets
    }
}

impl Add for ResourceShare {
    type Output = ResourceShare;

    fn add(self, rhs: Self) -> Self::Output {
        ResourceShare {
            threads: self.threads + rhs.threads,
            ram: self.ram + rhs.ram,
            buckets: self.buckets + rhs.buckets,
        }
    }
}

impl std::iter::Sum for ResourceShare {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ResourceShare::default(), Add::add)
    }
}

impl std::fmt::Display for ResourceShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} threads, {} MiB ram, {} buckets",
            self.threads, self.ram, self.buckets
        )
    }
}

/// Short identifier of a plot instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
