//! A [Stock] that mirrors every operation onto a shadow store and compares
//! reads, surfacing format divergences as errors.

use crate::{Stock, StockError, StockResult};

/// A primary [Stock] cross-checked by a shadow store.
///
/// Every mutation is applied to both stores; every read is performed on both
/// and compared. A divergence surfaces as [StockError::ShadowMismatch]
/// instead of silently propagating a corrupt record. The intended pairing is
/// a [FileStock](crate::FileStock) primary with an
/// [InMemoryStock](crate::InMemoryStock) shadow, which pins the on-disk
/// format against the in-memory reference during tests and soak runs.
pub struct ShadowStock<T> {
    primary: Box<dyn Stock<T>>,
    shadow: Box<dyn Stock<T>>,
}

impl<T> ShadowStock<T> {
    /// Pairs `primary` with `shadow`.
    pub fn new(primary: Box<dyn Stock<T>>, shadow: Box<dyn Stock<T>>) -> Self {
        Self { primary, shadow }
    }
}

impl<T: PartialEq + Send + Sync> Stock<T> for ShadowStock<T> {
    fn reserve(&self) -> StockResult<u64> {
        let index = self.primary.reserve()?;
        let mirrored = self.shadow.reserve()?;
        if index != mirrored {
            return Err(StockError::ShadowMismatch(index));
        }
        Ok(index)
    }

    fn get(&self, index: u64) -> StockResult<T> {
        let value = self.primary.get(index)?;
        let mirrored = self.shadow.get(index)?;
        if value != mirrored {
            return Err(StockError::ShadowMismatch(index));
        }
        Ok(value)
    }

    fn set(&self, index: u64, value: &T) -> StockResult<()> {
        self.primary.set(index, value)?;
        self.shadow.set(index, value)
    }

    fn delete(&self, index: u64) -> StockResult<()> {
        self.primary.delete(index)?;
        self.shadow.delete(index)
    }

    fn flush(&self) -> StockResult<()> {
        self.primary.flush()?;
        self.shadow.flush()
    }

    fn close(&self) -> StockResult<()> {
        self.primary.close()?;
        self.shadow.close()
    }

    fn len(&self) -> usize {
        self.primary.len()
    }

    fn memory_footprint(&self) -> usize {
        self.primary.memory_footprint() + self.shadow.memory_footprint()
    }
}

impl<T> std::fmt::Debug for ShadowStock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowStock").field("len", &self.primary.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStock;

    fn paired() -> ShadowStock<u64> {
        ShadowStock::new(
            Box::new(InMemoryStock::<u64>::new()),
            Box::new(InMemoryStock::<u64>::new()),
        )
    }

    #[test]
    fn operations_apply_to_both_sides() {
        let stock = paired();
        let a = stock.reserve().unwrap();
        stock.set(a, &99).unwrap();
        assert_eq!(stock.get(a).unwrap(), 99);
        stock.delete(a).unwrap();
        assert_eq!(stock.len(), 0);
    }

    #[test]
    fn divergent_reads_are_detected() {
        let primary = Box::new(InMemoryStock::<u64>::new());
        let shadow = Box::new(InMemoryStock::<u64>::new());
        // Desynchronize the shadow before pairing.
        let p = primary.reserve().unwrap();
        let s = shadow.reserve().unwrap();
        primary.set(p, &1).unwrap();
        shadow.set(s, &2).unwrap();

        let stock = ShadowStock::new(primary, shadow);
        assert!(matches!(stock.get(0), Err(StockError::ShadowMismatch(0))));
    }
}
