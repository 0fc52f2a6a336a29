//! Configuration resolved once per run, before any directory contact.

use std::collections::{BTreeMap, HashSet};

use crate::config::AppConfig;
use crate::errors::ConfigError;
use crate::mapper::AttributeMapper;
use crate::models::DirectoryRecord;
use crate::reconcile::ProfileSchema;
use crate::store::IdentityStore;

/// Everything the reconcilers need that derives from configuration.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub config: AppConfig,
    pub user_mapper: AttributeMapper,
    pub group_mapper: AttributeMapper,
    pub profiles: Vec<ProfileSchema>,
    pub user_attributes: Vec<String>,
    pub group_attributes: Vec<String>,
    /// Static groups every user belongs to, as directory records.
    pub default_groups: Vec<DirectoryRecord>,
    pub exempt: HashSet<String>,
}

impl RunPlan {
    /// Validate `config` against itself and the store, then resolve it.
    pub fn build(config: AppConfig, store: &dyn IdentityStore) -> Result<Self, ConfigError> {
        config.validate()?;

        if config.users.enabled && !store.is_unique_user_field(&config.users.username_field) {
            return Err(ConfigError::invalid(
                "users.username_field",
                format!(
                    "'{}' is not a unique field of the identity store",
                    config.users.username_field
                ),
            ));
        }
        if (config.groups.enabled || config.memberships.enabled)
            && !store.is_unique_group_field(&config.groups.name_field)
        {
            return Err(ConfigError::invalid(
                "groups.name_field",
                format!(
                    "'{}' is not a unique field of the identity store",
                    config.groups.name_field
                ),
            ));
        }

        let default_groups = config
            .memberships
            .default_groups
            .iter()
            .map(|group| DirectoryRecord {
                dn: group.dn.clone(),
                attributes: group
                    .attributes
                    .iter()
                    .map(|(name, values)| {
                        (
                            name.clone(),
                            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
                        )
                    })
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect();

        Ok(Self {
            user_mapper: AttributeMapper::new("users.attributes", &config.users.attributes),
            group_mapper: AttributeMapper::new("groups.attributes", &config.groups.attributes),
            profiles: config
                .users
                .profiles
                .iter()
                .map(|profile| ProfileSchema::from_config(profile, config.users.field_case))
                .collect(),
            user_attributes: config.user_search_attributes(),
            group_attributes: config.group_search_attributes(),
            default_groups,
            exempt: config.users.exempt.iter().cloned().collect(),
            config,
        })
    }
}
