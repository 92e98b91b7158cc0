use crate::{ConfigError, Domain, DomainConfig, RoutingConfig};
use regex::Regex;

/// Caller's steer for domain selection
#[derive(Debug, Clone, PartialEq)]
pub enum DomainHint {
    /// Route as this domain
    Domain(Domain),
    /// Free-form request context matched against domain patterns
    Context(String),
}

/// Classifies request context into a [`Domain`] using the ordered pattern
/// table from [`RoutingConfig`]. The first matching rule wins.
pub struct DomainRouter {
    rules: Vec<(Domain, Vec<Regex>)>,
    configs: Vec<DomainConfig>,
    default_index: usize,
}

impl DomainRouter {
    pub fn new(config: &RoutingConfig) -> Result<Self, ConfigError> {
        let mut issues = Vec::new();
        let mut rules = Vec::with_capacity(config.domains.len());

        for domain in &config.domains {
            let mut compiled = Vec::with_capacity(domain.patterns.len());
            for pattern in &domain.patterns {
                match Regex::new(pattern) {
                    Ok(re) => compiled.push(re),
                    Err(e) => issues.push(format!("domain {} pattern {:?}: {}", domain.domain, pattern, e)),
                }
            }
            rules.push((domain.domain, compiled));
        }

        let default_index = config.domains.iter().position(|d| d.domain == Domain::DEFAULT);
        if default_index.is_none() {
            issues.push(format!("default domain {} has no configuration", Domain::DEFAULT));
        }

        match default_index {
            Some(default_index) if issues.is_empty() => Ok(Self {
                rules,
                configs: config.domains.clone(),
                default_index,
            }),
            _ => Err(ConfigError { issues }),
        }
    }

    pub fn detect_domain(&self, context: &str) -> Domain {
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(context)))
            .map(|(domain, _)| *domain)
            .unwrap_or(Domain::DEFAULT)
    }

    pub fn resolve(&self, hint: &DomainHint) -> Domain {
        match hint {
            DomainHint::Domain(domain) => *domain,
            DomainHint::Context(context) => self.detect_domain(context),
        }
    }

    /// Configuration for `domain`, or the default domain's when absent
    pub fn get_domain_config(&self, domain: Domain) -> &DomainConfig {
        self.configs
            .iter()
            .find(|c| c.domain == domain)
            .unwrap_or(&self.configs[self.default_index])
    }
}
