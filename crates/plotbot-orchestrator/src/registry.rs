//! Name-keyed registry of strategy factories
//!
//! Every delay policy, drive clearer and progress parser referenced from
//! configuration is built here once at startup. Unknown names and bad
//! arguments surface as configuration errors before anything runs.

use plotbot_core::{ComponentSpec, PlotError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clearer::{DriveClearer, OgDateClearer, OgSizeClearer, ZeroByteClearer};
use crate::delay::{DelayPolicy, ProgressFileContainsDelay, TimeStartedDelay};
use crate::parser::{ChiaParser, MadMaxParser, ProgressParser, RegexParser, StringParser};

pub type DelayFactory = fn(&[String]) -> Result<Arc<dyn DelayPolicy>>;
pub type ClearerFactory = fn(&[String]) -> Result<Arc<dyn DriveClearer>>;
pub type ParserFactory = fn(&[String]) -> Result<Arc<dyn ProgressParser>>;

const DELAY: &str = "delay policy";
const CLEARER: &str = "drive clearer";
const PARSER: &str = "progress parser";

/// Factories for the three strategy families
#[derive(Clone)]
pub struct Registry {
    delays: BTreeMap<String, DelayFactory>,
    clearers: BTreeMap<String, ClearerFactory>,
    parsers: BTreeMap<String, ParserFactory>,
}

impl Registry {
    /// A registry without any components
    pub fn empty() -> Self {
        Self {
            delays: BTreeMap::new(),
            clearers: BTreeMap::new(),
            parsers: BTreeMap::new(),
        }
    }

    pub fn register_delay(&mut self, name: &str, factory: DelayFactory) {
        self.delays.insert(name.to_string(), factory);
    }

    pub fn register_clearer(&mut self, name: &str, factory: ClearerFactory) {
        self.clearers.insert(name.to_string(), factory);
    }

    pub fn register_parser(&mut self, name: &str, factory: ParserFactory) {
        self.parsers.insert(name.to_string(), factory);
    }

    pub fn delay(&self, spec: &ComponentSpec) -> Result<Arc<dyn DelayPolicy>> {
        build(&self.delays, DELAY, spec)
    }

    pub fn clearer(&self, spec: &ComponentSpec) -> Result<Arc<dyn DriveClearer>> {
        build(&self.clearers, CLEARER, spec)
    }

    pub fn parser(&self, spec: &ComponentSpec) -> Result<Arc<dyn ProgressParser>> {
        build(&self.parsers, PARSER, spec)
    }

    pub fn delay_names(&self) -> impl Iterator<Item = &str> {
        self.delays.keys().map(String::as_str)
    }

    pub fn clearer_names(&self) -> impl Iterator<Item = &str> {
        self.clearers.keys().map(String::as_str)
    }

    pub fn parser_names(&self) -> impl Iterator<Item = &str> {
        self.parsers.keys().map(String::as_str)
    }
}

fn build<T: ?Sized>(
    factories: &BTreeMap<String, fn(&[String]) -> Result<Arc<T>>>,
    family: &'static str,
    spec: &ComponentSpec,
) -> Result<Arc<T>> {
    let factory = factories
        .get(spec.name.as_str())
        .ok_or_else(|| PlotError::UnknownComponent {
            family,
            name: spec.name.clone(),
        })?;
    factory(&spec.args).map_err(|e| match e {
        PlotError::Configuration(message) => {
            PlotError::config(format!("{} `{}`: {}", family, spec, message))
        }
        other => other,
    })
}

fn no_args(name: &str, args: &[String]) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(PlotError::config(format!("{} takes no arguments", name)))
    }
}

impl Default for Registry {
    /// Registry with every built-in component
    fn default() -> Self {
        let mut registry = Self::empty();

        registry.register_delay("time-started", |args| {
            Ok(Arc::new(TimeStartedDelay::from_args(args)?))
        });
        registry.register_delay("progress-file-contains", |args| {
            Ok(Arc::new(ProgressFileContainsDelay::from_args(args)?))
        });

        registry.register_clearer("og-date", |args| Ok(Arc::new(OgDateClearer::from_args(args)?)));
        registry.register_clearer("og-size", |args| Ok(Arc::new(OgSizeClearer::from_args(args)?)));
        registry.register_clearer("zero-byte", |args| {
            Ok(Arc::new(ZeroByteClearer::from_args(args)?))
        });

        registry.register_parser("string", |args| Ok(Arc::new(StringParser::from_args(args)?)));
        registry.register_parser("regex", |args| Ok(Arc::new(RegexParser::from_args(args)?)));
        registry.register_parser("madmax", |args| {
            no_args("madmax", args)?;
            Ok(Arc::new(MadMaxParser))
        });
        registry.register_parser("chia", |args| {
            no_args("chia", args)?;
            Ok(Arc::new(ChiaParser))
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::default();
        assert_eq!(
            registry.delay_names().collect::<Vec<_>>(),
            ["progress-file-contains", "time-started"]
        );
        assert_eq!(
            registry.clearer_names().collect::<Vec<_>>(),
            ["og-date", "og-size", "zero-byte"]
        );
        assert_eq!(registry.parser_names().count(), 4);
    }

    #[test]
    fn test_build_components() {
        let registry = Registry::default();
        let delay = registry
            .delay(&ComponentSpec::new("time-started").with_arg("10"))
            .unwrap();
        assert_eq!(delay.name(), "time-started");

        let clearer = registry
            .clearer(&ComponentSpec::new("og-size").with_arg("before=2022-01-01"))
            .unwrap();
        assert_eq!(clearer.name(), "og-size");
        assert!(registry.clearer(&ComponentSpec::new("og-size")).is_err());

        let parser = registry.parser(&ComponentSpec::new("chia")).unwrap();
        assert_eq!(parser.name(), "chia");
    }

    #[test]
    fn test_unknown_name_fails_fast() {
        let registry = Registry::default();
        let err = registry
            .clearer(&ComponentSpec::new("og-random"))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PlotError::UnknownComponent { family: "drive clearer", .. }
        ));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bad_args_name_the_component() {
        let registry = Registry::default();
        let err = registry
            .delay(&ComponentSpec::new("time-started").with_arg("soon"))
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("time-started(soon)"));

        assert!(registry
            .parser(&ComponentSpec::new("madmax").with_arg("x"))
            .is_err());
    }

    #[test]
    fn test_register_custom_component() {
        let mut registry = Registry::empty();
        assert!(registry.parser(&ComponentSpec::new("chia")).is_err());
        registry.register_parser("chia", |_| Ok(Arc::new(ChiaParser)));
        assert!(registry.parser(&ComponentSpec::new("chia")).is_ok());
    }
}
