use crate::Result;

/// A partial set of settings that can be stacked on top of other layers
///
/// Implementors keep every field optional; [`merge`](ConfigBuilder::merge)
/// copies over the fields the other layer sets, so later layers win.
pub trait ConfigBuilder: Default + Clone {
    /// Reject values that are out of range
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Read a layer from `{prefix}{FIELD}` variables
    fn from_env(prefix: &str) -> Result<Self>;

    /// Overlay `other` on `self`
    fn merge(&mut self, other: Self) -> &mut Self;

    /// Fold `layers` in order, lowest precedence first, and validate the result
    fn layered<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut merged = Self::default();
        for layer in layers {
            merged.merge(layer);
        }
        merged.validate()?;
        Ok(merged)
    }
}
