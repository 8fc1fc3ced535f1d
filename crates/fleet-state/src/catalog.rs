//! Catalog model: applications, packages, channels, and groups.
//!
//! The rollout engine only reads the catalog. Writes go through the checks
//! here so that the engine can assume every channel points at a package of
//! the right application and architecture that does not blacklist it.
//!
//! Rows are created once and never overwritten by a create. A channel's
//! package pointer moves only through [`Catalog::update_channel_package`],
//! which validates, writes and records the activity in one transaction.

use fleet_core::{is_sha256_hex, parse_version, Arch, InvalidArch};
use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::error::StateError;
use crate::store::{append_activity_in, map_err, read_row, write_row, StateStore};
use crate::tables::{JsonTable, APPLICATIONS, CHANNELS, GROUPS, PACKAGES};
use crate::types::*;

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Validation failures raised before data reaches the engine.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("package does not belong to the channel's application")]
    InvalidPackage,

    #[error("package arch does not match channel arch")]
    ArchMismatch,

    #[error("package has blacklisted this channel")]
    BlacklistedChannel,

    #[error(transparent)]
    InvalidArch(#[from] InvalidArch),

    #[error("channel {0} belongs to another application")]
    InvalidChannel(String),

    #[error("invalid version {version}: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("invalid artifact hash: {0}")]
    InvalidHash(String),

    #[error("invalid rollout policy: {0}")]
    InvalidPolicy(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl CatalogError {
    fn not_found(kind: &'static str, id: &str) -> Self {
        CatalogError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether this is a synchronous validation rejection.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            CatalogError::NotFound { .. }
                | CatalogError::AlreadyExists { .. }
                | CatalogError::State(_)
        )
    }
}

/// Read-mostly view of the catalog tables plus the validated write path.
#[derive(Clone)]
pub struct Catalog {
    store: StateStore,
}

impl Catalog {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_application(&self, id: &str) -> CatalogResult<Application> {
        self.store
            .get_application(id)?
            .ok_or_else(|| CatalogError::not_found("application", id))
    }

    pub fn get_package(&self, id: &str) -> CatalogResult<Package> {
        self.store
            .get_package(id)?
            .ok_or_else(|| CatalogError::not_found("package", id))
    }

    pub fn get_channel(&self, id: &str) -> CatalogResult<ResolvedChannel> {
        self.store
            .get_channel_resolved(id)?
            .ok_or_else(|| CatalogError::not_found("channel", id))
    }

    pub fn get_group(&self, id: &str) -> CatalogResult<Group> {
        self.store
            .get_group(id)?
            .ok_or_else(|| CatalogError::not_found("group", id))
    }

    /// Group, its channel and the effective package from one snapshot.
    pub fn group_context(&self, id: &str) -> CatalogResult<GroupContext> {
        self.store
            .get_group_context(id)?
            .ok_or_else(|| CatalogError::not_found("group", id))
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Check that `package_id` may be placed on `channel_id`.
    ///
    /// Blacklist membership is a `BTreeSet` lookup.
    pub fn validate_package_placement(
        &self,
        package_id: &str,
        channel_id: &str,
        application_id: &str,
        arch: Arch,
    ) -> CatalogResult<Package> {
        let pkg = self.get_package(package_id)?;
        check_placement(&pkg, channel_id, application_id, arch)?;
        Ok(pkg)
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub fn add_application(&self, app: &Application) -> CatalogResult<()> {
        self.in_write(|txn| insert_row(txn, APPLICATIONS, "application", &app.id, app))?;
        info!(application = %app.id, "application created");
        Ok(())
    }

    pub fn add_package(&self, pkg: &Package) -> CatalogResult<()> {
        self.get_application(&pkg.application_id)?;
        parse_version(&pkg.version).map_err(|e| CatalogError::InvalidVersion {
            version: pkg.version.clone(),
            reason: e.to_string(),
        })?;
        if !is_sha256_hex(&pkg.artifact.hash) {
            return Err(CatalogError::InvalidHash(pkg.artifact.hash.clone()));
        }
        self.in_write(|txn| insert_row(txn, PACKAGES, "package", &pkg.id, pkg))?;
        info!(package = %pkg.id, version = %pkg.version, "package created");
        Ok(())
    }

    pub fn add_channel(&self, channel: &Channel) -> CatalogResult<()> {
        self.get_application(&channel.application_id)?;
        self.in_write(|txn| {
            if let Some(package_id) = &channel.package_id {
                placement_in(
                    txn,
                    package_id,
                    &channel.id,
                    &channel.application_id,
                    channel.arch,
                )?;
            }
            insert_row(txn, CHANNELS, "channel", &channel.id, channel)
        })?;
        info!(channel = %channel.id, package = ?channel.package_id, "channel created");
        Ok(())
    }

    /// Point a channel at a different package (or at none).
    ///
    /// On failure nothing is written. A change of pointer to a package
    /// appends a `ChannelPackageUpdated` activity in the same transaction.
    pub fn update_channel_package(
        &self,
        channel_id: &str,
        package_id: Option<&str>,
        now: u64,
    ) -> CatalogResult<Channel> {
        let (channel, released) = self.in_write(|txn| {
            let mut channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
            let mut channel: Channel = read_row(&channels, channel_id)?
                .ok_or_else(|| CatalogError::not_found("channel", channel_id))?;
            let pkg = match package_id {
                Some(id) => Some(placement_in(
                    txn,
                    id,
                    &channel.id,
                    &channel.application_id,
                    channel.arch,
                )?),
                None => None,
            };

            let before = channel.package_id.clone();
            channel.package_id = package_id.map(str::to_string);
            write_row(&mut channels, channel_id, &channel)?;
            drop(channels);

            let released = match pkg {
                Some(pkg) if before != channel.package_id => {
                    let activity = Activity::channel_package_updated(&channel, &pkg, now);
                    append_activity_in(txn, &activity)?;
                    Some(pkg.version)
                }
                _ => None,
            };
            Ok((channel, released))
        })?;

        if let Some(version) = released {
            info!(channel = %channel.id, %version, "channel package updated");
        }
        Ok(channel)
    }

    pub fn add_group(&self, group: &Group) -> CatalogResult<()> {
        self.get_application(&group.application_id)?;
        let channel = self.get_channel(&group.channel_id)?.channel;
        if channel.application_id != group.application_id {
            return Err(CatalogError::InvalidChannel(channel.id));
        }
        validate_policy(&group.policy)?;
        self.in_write(|txn| insert_row(txn, GROUPS, "group", &group.id, group))?;
        info!(group = %group.id, channel = %group.channel_id, "group created");
        Ok(())
    }

    /// Replace a group's rollout policy.
    pub fn update_group_policy(&self, group_id: &str, policy: RolloutPolicy) -> CatalogResult<Group> {
        let mut group = self.get_group(group_id)?;
        validate_policy(&policy)?;
        group.policy = policy;
        self.store.put_group(&group)?;
        Ok(group)
    }

    /// Run `f` inside one write transaction; commit on success, abort otherwise.
    fn in_write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let txn = self.store.begin_write()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }
}

fn check_placement(
    pkg: &Package,
    channel_id: &str,
    application_id: &str,
    arch: Arch,
) -> CatalogResult<()> {
    if pkg.application_id != application_id {
        return Err(CatalogError::InvalidPackage);
    }
    if pkg.arch != arch {
        return Err(CatalogError::ArchMismatch);
    }
    if pkg.blacklists(channel_id) {
        return Err(CatalogError::BlacklistedChannel);
    }
    Ok(())
}

/// Placement check against the package row as seen by `txn`.
fn placement_in(
    txn: &WriteTransaction,
    package_id: &str,
    channel_id: &str,
    application_id: &str,
    arch: Arch,
) -> CatalogResult<Package> {
    let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
    let pkg: Package = read_row(&packages, package_id)?
        .ok_or_else(|| CatalogError::not_found("package", package_id))?;
    check_placement(&pkg, channel_id, application_id, arch)?;
    Ok(pkg)
}

/// Insert a new row; an existing row with the same key is left alone.
fn insert_row<T: Serialize>(
    txn: &WriteTransaction,
    table: JsonTable,
    kind: &'static str,
    id: &str,
    value: &T,
) -> CatalogResult<()> {
    let mut t = txn.open_table(table).map_err(map_err!(Table))?;
    if t.get(id).map_err(map_err!(Read))?.is_some() {
        return Err(CatalogError::AlreadyExists {
            kind,
            id: id.to_string(),
        });
    }
    write_row(&mut t, id, value)?;
    Ok(())
}

fn validate_policy(policy: &RolloutPolicy) -> CatalogResult<()> {
    if policy.period_interval_secs == 0 {
        return Err(CatalogError::InvalidPolicy(
            "period_interval_secs must be positive".to_string(),
        ));
    }
    if let FailureThreshold::Ratio(r) = policy.failure_threshold {
        if !(0.0..=1.0).contains(&r) {
            return Err(CatalogError::InvalidPolicy(format!(
                "failure ratio {r} outside [0, 1]"
            )));
        }
    }
    Ok(())
}
