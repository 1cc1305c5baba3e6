//! Per-attribute configuration.

use color_eyre::{eyre::eyre, Result};

use crate::dispatch::DispatchParams;
use crate::expiration::Expiration;
use crate::settings::Settings;
use crate::store::Slot;
use crate::value::{Value, ValueKind};

/// Configuration of one cached attribute on one record type.
///
/// Built through [`CachedAttribute::builder`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAttribute {
  name: String,
  value_kind: ValueKind,
  cached_field: String,
  recalculation_needed_field: String,
  expiration_field: Option<String>,
  calculation_method: String,
  temporal_triggers: bool,
  dispatch_params: DispatchParams,
  default_expiration: Option<Expiration>,
  index_on_flag: bool,
  index_on_expiration: bool,
}

impl CachedAttribute {
  pub fn builder(name: impl Into<String>) -> CachedAttributeBuilder {
    CachedAttributeBuilder {
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn value_kind(&self) -> ValueKind {
    self.value_kind
  }

  pub fn cached_field(&self) -> &str {
    &self.cached_field
  }

  pub fn recalculation_needed_field(&self) -> &str {
    &self.recalculation_needed_field
  }

  /// Present iff temporal triggers are enabled.
  pub fn expiration_field(&self) -> Option<&str> {
    self.expiration_field.as_deref()
  }

  pub fn calculation_method(&self) -> &str {
    &self.calculation_method
  }

  pub fn temporal_triggers(&self) -> bool {
    self.temporal_triggers
  }

  pub fn dispatch_params(&self) -> &DispatchParams {
    &self.dispatch_params
  }

  pub fn default_expiration(&self) -> Option<Expiration> {
    self.default_expiration
  }

  pub fn value_slot(&self) -> Slot {
    Slot::new(&self.cached_field, self.value_kind)
  }

  /// New rows start flagged so their first read computes a value.
  pub fn flag_slot(&self) -> Slot {
    Slot::new(&self.recalculation_needed_field, ValueKind::Boolean)
      .with_default(Value::Boolean(true))
      .indexed(self.index_on_flag)
  }

  pub fn expiration_slot(&self) -> Option<Slot> {
    self.expiration_field.as_ref().map(|field| {
      Slot::new(field, ValueKind::DateTime).indexed(self.index_on_expiration)
    })
  }

  /// Every storage slot this attribute needs.
  pub fn slots(&self) -> Vec<Slot> {
    let mut slots = vec![self.value_slot(), self.flag_slot()];
    slots.extend(self.expiration_slot());
    slots
  }
}

/// Builder for [`CachedAttribute`]. Unset options fall back to naming
/// conventions derived from the attribute name, or to [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct CachedAttributeBuilder {
  name: String,
  value_kind: ValueKind,
  cached_field: Option<String>,
  recalculation_needed_field: Option<String>,
  expiration_field: Option<String>,
  calculation_method: Option<String>,
  temporal_triggers: Option<bool>,
  dispatch_params: Option<DispatchParams>,
  index_on_flag: bool,
  index_on_expiration: bool,
}

impl CachedAttributeBuilder {
  pub fn value_kind(mut self, kind: ValueKind) -> Self {
    self.value_kind = kind;
    self
  }

  pub fn cached_field(mut self, name: impl Into<String>) -> Self {
    self.cached_field = Some(name.into());
    self
  }

  pub fn recalculation_needed_field(mut self, name: impl Into<String>) -> Self {
    self.recalculation_needed_field = Some(name.into());
    self
  }

  pub fn expiration_field(mut self, name: impl Into<String>) -> Self {
    self.expiration_field = Some(name.into());
    self
  }

  pub fn calculation_method(mut self, name: impl Into<String>) -> Self {
    self.calculation_method = Some(name.into());
    self
  }

  pub fn temporal_triggers(mut self, enabled: bool) -> Self {
    self.temporal_triggers = Some(enabled);
    self
  }

  pub fn dispatch_params(mut self, params: DispatchParams) -> Self {
    self.dispatch_params = Some(params);
    self
  }

  pub fn index_on_flag(mut self, indexed: bool) -> Self {
    self.index_on_flag = indexed;
    self
  }

  pub fn index_on_expiration(mut self, indexed: bool) -> Self {
    self.index_on_expiration = indexed;
    self
  }

  /// Resolve names and defaults, failing on names storage can't hold.
  pub fn build(self, settings: &Settings) -> Result<CachedAttribute> {
    let name = self.name;
    validate_identifier("attribute name", &name)?;

    let temporal_triggers = self
      .temporal_triggers
      .unwrap_or(settings.default_expiration.is_some());

    let cached_field = self
      .cached_field
      .unwrap_or_else(|| format!("cached_{}", name));
    let recalculation_needed_field = self
      .recalculation_needed_field
      .unwrap_or_else(|| format!("{}_recalculation_needed", name));
    let expiration_field = temporal_triggers.then(|| {
      self
        .expiration_field
        .unwrap_or_else(|| format!("{}_expires_after", name))
    });
    let calculation_method = self
      .calculation_method
      .unwrap_or_else(|| format!("calculate_{}", name));

    validate_identifier("cached field", &cached_field)?;
    validate_identifier("recalculation-needed field", &recalculation_needed_field)?;
    if let Some(field) = &expiration_field {
      validate_identifier("expiration field", field)?;
    }
    if calculation_method.is_empty() {
      return Err(eyre!("Calculation method for '{}' is empty", name));
    }

    let mut fields = vec![&cached_field, &recalculation_needed_field];
    fields.extend(expiration_field.as_ref());
    for (i, field) in fields.iter().enumerate() {
      if fields[i + 1..].contains(field) {
        return Err(eyre!(
          "Cached attribute '{}' uses slot '{}' more than once",
          name,
          field
        ));
      }
    }

    Ok(CachedAttribute {
      value_kind: self.value_kind,
      cached_field,
      recalculation_needed_field,
      expiration_field,
      calculation_method,
      temporal_triggers,
      dispatch_params: self
        .dispatch_params
        .unwrap_or_else(|| settings.dispatch.clone()),
      default_expiration: settings.default_expiration,
      index_on_flag: self.index_on_flag,
      index_on_expiration: self.index_on_expiration,
      name,
    })
  }
}

/// Slot names end up as column names: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn validate_identifier(what: &str, name: &str) -> Result<()> {
  let mut chars = name.chars();
  let valid = match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => {
      chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
    _ => false,
  };

  if valid {
    Ok(())
  } else {
    Err(eyre!("Invalid {} '{}'", what, name))
  }
}
