use crate::{DomainError, Result};

/// Collection tuning for a single domain.
#[derive(Debug, Clone)]
pub struct DomainSettings {
    /// Allocations before the first collection of a fresh domain.
    pub first_collection_after: usize,
    /// Lower clamp for the adaptive collection threshold.
    pub min_collect_threshold: usize,
    /// Upper clamp for the adaptive collection threshold.
    pub max_collect_threshold: usize,
    /// Longest display name in bytes, longer names are truncated.
    pub max_name_len: usize,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            first_collection_after: 8,
            min_collect_threshold: 1024,
            max_collect_threshold: 4 * 1024 * 1024, // 4M survivors
            max_name_len: 31,
        }
    }
}

impl DomainSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.first_collection_after == 0 {
            return Err("first_collection_after must be > 0");
        }
        if self.min_collect_threshold == 0 {
            return Err("min_collect_threshold must be > 0");
        }
        if self.min_collect_threshold > self.max_collect_threshold {
            return Err("min_collect_threshold must not exceed max_collect_threshold");
        }
        if self.max_name_len == 0 {
            return Err("max_name_len must be > 0");
        }
        Ok(())
    }
}

/// Settings for the process-wide [`crate::DomainRegistry`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Identifiers handed out per id page.
    pub id_page_size: usize,
    /// Hard cap on id pages, bounds the number of live domains.
    pub max_id_pages: usize,
    /// Name of the permanent default domain.
    pub default_domain_name: String,
    /// Settings every domain of this registry is created with.
    pub domain: DomainSettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            id_page_size: 256,
            max_id_pages: 256,
            default_domain_name: "Zero".to_owned(),
            domain: DomainSettings::default(),
        }
    }
}

impl RegistrySettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id_page_size == 0 || self.max_id_pages == 0 {
            return Err("id pool sizes must be > 0");
        }
        if self
            .id_page_size
            .checked_mul(self.max_id_pages)
            .is_none_or(|total| total > u32::MAX as usize)
        {
            return Err("id pool must fit in 32-bit slot indices");
        }
        self.domain.validate()
    }

    pub(crate) fn checked(self) -> Result<Self> {
        self.validate().map_err(DomainError::InvalidSettings)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DomainSettings::default().validate().is_ok());
        assert!(RegistrySettings::default().validate().is_ok());
    }

    #[test]
    fn inverted_threshold_clamp_is_rejected() {
        let settings = DomainSettings {
            min_collect_threshold: 10,
            max_collect_threshold: 5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_id_pool_is_rejected_as_domain_error() {
        let settings = RegistrySettings {
            max_id_pages: 0,
            ..Default::default()
        };
        assert_eq!(
            settings.checked().unwrap_err(),
            DomainError::InvalidSettings("id pool sizes must be > 0")
        );
    }
}
