//! Registry of model types and the cached attributes bound to them.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::attribute::CachedAttribute;
use crate::model::Model;
use crate::store::Store;

/// Maps `(model type, attribute name)` to attribute configuration.
#[derive(Default)]
pub struct Registry {
  models: HashMap<String, Arc<dyn Model>>,
  attributes: HashMap<String, HashMap<String, Arc<CachedAttribute>>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a model type. Registering the same type name again keeps the
  /// first registration and returns `false`.
  pub fn register(&mut self, model: Arc<dyn Model>) -> bool {
    let type_name = model.type_name().to_string();
    if self.models.contains_key(&type_name) {
      return false;
    }
    debug!(model = %type_name, "registered model");
    self.models.insert(type_name, model);
    true
  }

  /// Bind a cached attribute to a model type and declare its slots.
  ///
  /// Fails if the model already has an attribute with this name or doesn't
  /// provide the attribute's calculation.
  pub fn bind<S: Store + ?Sized>(
    &mut self,
    store: &S,
    model: Arc<dyn Model>,
    attribute: CachedAttribute,
  ) -> Result<Arc<CachedAttribute>> {
    let type_name = model.type_name().to_string();

    if self
      .attributes
      .get(&type_name)
      .is_some_and(|attrs| attrs.contains_key(attribute.name()))
    {
      return Err(eyre!(
        "Cached attribute '{}' is already bound to {}",
        attribute.name(),
        type_name
      ));
    }

    if !model.provides(attribute.calculation_method()) {
      return Err(eyre!(
        "{} has no calculation method '{}' for cached attribute '{}'",
        type_name,
        attribute.calculation_method(),
        attribute.name()
      ));
    }

    store.declare_slots(model.table(), &attribute.slots())?;
    self.register(Arc::clone(&model));

    let attribute = Arc::new(attribute);
    self
      .attributes
      .entry(type_name.clone())
      .or_default()
      .insert(attribute.name().to_string(), Arc::clone(&attribute));
    debug!(model = %type_name, attribute = attribute.name(), "bound cached attribute");

    Ok(attribute)
  }

  pub fn model(&self, type_name: &str) -> Result<Arc<dyn Model>> {
    self
      .models
      .get(type_name)
      .cloned()
      .ok_or_else(|| eyre!("Unknown model type {}", type_name))
  }

  /// Look up an attribute, falling back to the canonical type for aliases.
  pub fn attribute(&self, type_name: &str, name: &str) -> Result<Arc<CachedAttribute>> {
    self
      .own_attributes(type_name)?
      .and_then(|attrs| attrs.get(name))
      .cloned()
      .ok_or_else(|| eyre!("{} has no cached attribute '{}'", type_name, name))
  }

  /// Every attribute of a type, ordered by name.
  pub fn attributes(&self, type_name: &str) -> Result<Vec<Arc<CachedAttribute>>> {
    let mut attrs: Vec<_> = self
      .own_attributes(type_name)?
      .map(|attrs| attrs.values().cloned().collect())
      .unwrap_or_default();
    attrs.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(attrs)
  }

  fn own_attributes(
    &self,
    type_name: &str,
  ) -> Result<Option<&HashMap<String, Arc<CachedAttribute>>>> {
    let model = self.model(type_name)?;
    Ok(
      self
        .attributes
        .get(type_name)
        .or_else(|| self.attributes.get(model.canonical_type())),
    )
  }
}
