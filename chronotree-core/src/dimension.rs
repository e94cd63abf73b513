//! Dimension registry: the catalog of dimension descriptors (unit,
//! value domain, optional derivation rule) shared across a tree.

use chronotree_storage::DimensionValue;
use std::collections::HashMap;
use std::sync::Arc;

/// The domain a stored dimension's values must satisfy.
#[derive(Clone, Debug)]
pub enum ValueDomain {
    /// Inclusive numeric range.
    Numeric { min: f64, max: f64 },
    /// A fixed set of accepted strings.
    Enumeration(Vec<String>),
    /// No constraint beyond structural type coercion.
    Unconstrained,
}

impl ValueDomain {
    fn accepts(&self, value: &DimensionValue) -> bool {
        match self {
            ValueDomain::Numeric { min, max } => value
                .as_number()
                .map(|n| n >= *min && n <= *max)
                .unwrap_or(false),
            ValueDomain::Enumeration(allowed) => allowed.contains(&value.as_text()),
            ValueDomain::Unconstrained => true,
        }
    }
}

/// A pure function computing a derived dimension's value from its
/// named inputs, evaluated at one timestamp. Returns `None` if any
/// input was missing (the caller, `Node`, is responsible for supplying
/// `None` when it could not resolve an input itself).
pub type DerivationFn = Arc<dyn Fn(&[Option<f64>]) -> Option<f64> + Send + Sync>;

/// Catalog entry for one dimension.
#[derive(Clone)]
pub struct DimensionDescriptor {
    pub name: String,
    pub display_name: String,
    pub unit: Option<String>,
    pub value_domain: ValueDomain,
    pub is_derived: bool,
    /// Present only for derived dimensions: the ordered input
    /// dimension names and the function combining their values.
    pub derivation: Option<(Vec<String>, DerivationFn)>,
}

impl DimensionDescriptor {
    /// Build a stored (non-derived) descriptor.
    pub fn stored(name: impl Into<String>, display_name: impl Into<String>, unit: Option<String>, domain: ValueDomain) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            unit,
            value_domain: domain,
            is_derived: false,
            derivation: None,
        }
    }

    /// Build a derived descriptor: never accepts direct writes.
    pub fn derived(
        name: impl Into<String>,
        display_name: impl Into<String>,
        unit: Option<String>,
        inputs: Vec<String>,
        compute: DerivationFn,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            unit,
            value_domain: ValueDomain::Unconstrained,
            is_derived: true,
            derivation: Some((inputs, compute)),
        }
    }

    /// Type-coerce and domain-check `value`.
    pub fn validate(&self, value: &DimensionValue) -> bool {
        self.value_domain.accepts(value)
    }

    /// Render `value` for display, respecting unit.
    pub fn format(&self, value: &DimensionValue) -> String {
        match &self.unit {
            Some(unit) => format!("{} {unit}", value.as_text()),
            None => value.as_text(),
        }
    }

    /// Evaluate the derivation rule given resolved input values, in
    /// the same order as `derivation`'s input name list.
    pub fn derive(&self, inputs: &[Option<f64>]) -> Option<f64> {
        self.derivation.as_ref().and_then(|(_, compute)| compute(inputs))
    }
}

/// A process-wide catalog mapping dimension name to descriptor.
/// Registration is idempotent: re-registering an existing name is a
/// no-op rather than an error.
#[derive(Clone, Default)]
pub struct DimensionRegistry {
    descriptors: HashMap<String, DimensionDescriptor>,
}

impl DimensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the canonical metered/reference
    /// flow dimensions and the derived `loss_rate = (reference -
    /// metered) / reference`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DimensionDescriptor::stored(
            "metered",
            "Metered flow",
            Some("m3".to_string()),
            ValueDomain::Numeric {
                min: 0.0,
                max: f64::MAX,
            },
        ));
        registry.register(DimensionDescriptor::stored(
            "reference",
            "Reference flow",
            Some("m3".to_string()),
            ValueDomain::Numeric {
                min: 0.0,
                max: f64::MAX,
            },
        ));
        registry.register(DimensionDescriptor::derived(
            "loss_rate",
            "Loss rate",
            None,
            vec!["reference".to_string(), "metered".to_string()],
            Arc::new(|inputs: &[Option<f64>]| {
                let reference = inputs.first().copied().flatten()?;
                let metered = inputs.get(1).copied().flatten()?;
                if reference == 0.0 {
                    return Some(0.0);
                }
                Some((reference - metered) / reference)
            }),
        ));
        registry
    }

    pub fn register(&mut self, descriptor: DimensionDescriptor) {
        self.descriptors.entry(descriptor.name.clone()).or_insert(descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&DimensionDescriptor> {
        self.descriptors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_loss_rate_matches_formula() {
        let registry = DimensionRegistry::with_builtins();
        let loss_rate = registry.get("loss_rate").unwrap();
        assert!(loss_rate.is_derived);
        let value = loss_rate.derive(&[Some(2000.0), Some(1900.0)]).unwrap();
        assert!((value - 0.05).abs() < 1e-9);
    }

    #[test]
    fn derive_is_none_when_input_missing() {
        let registry = DimensionRegistry::with_builtins();
        let loss_rate = registry.get("loss_rate").unwrap();
        assert!(loss_rate.derive(&[Some(2000.0), None]).is_none());
    }

    #[test]
    fn registration_is_idempotent_by_name() {
        let mut registry = DimensionRegistry::new();
        registry.register(DimensionDescriptor::stored("x", "X", None, ValueDomain::Unconstrained));
        registry.register(DimensionDescriptor::stored("x", "Overwritten", None, ValueDomain::Unconstrained));
        assert_eq!(registry.get("x").unwrap().display_name, "X");
    }

    #[test]
    fn domain_validation_rejects_out_of_range() {
        let registry = DimensionRegistry::with_builtins();
        let metered = registry.get("metered").unwrap();
        assert!(metered.validate(&DimensionValue::Number(10.0)));
        assert!(!metered.validate(&DimensionValue::Number(-1.0)));
    }
}
