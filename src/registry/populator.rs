// src/registry/populator.rs

//! Batch population from bundle directories
//!
//! A batch runs in four phases: parse every directory, sanity-check the
//! batch against storage, insert in the requested mode, and prune superseded
//! bundle payloads. Parse and sanity failures abort before anything is
//! written.

use super::{
    GraphLoader, Load, Mode, PackageChannel, PackageManifest, PopulateOptions, Query,
    generate_or_empty,
};
use crate::bundle::{Bundle, ImageInput};
use crate::error::{Error, Result};
use crate::graph::replaces::Admission;
use crate::graph::{ReplacesGraphLoader, SemverGraphLoader};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

/// What a populate call did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateSummary {
    /// Bundle names in insertion order, overwrites excluded
    pub inserted: Vec<String>,
    /// Insertion passes run; a non-empty semver batch counts as one
    pub passes: usize,
    /// Bundle names whose head payload was overwritten
    pub overwrites: Vec<String>,
}

/// Loads a batch of bundle directories into the catalog
pub struct DirectoryPopulator<'a> {
    loader: &'a dyn Load,
    graph_loader: &'a dyn GraphLoader,
    querier: &'a dyn Query,
    /// (image reference, bundle directory) pairs
    images: Vec<(String, PathBuf)>,
}

impl<'a> DirectoryPopulator<'a> {
    pub fn new(
        loader: &'a dyn Load,
        graph_loader: &'a dyn GraphLoader,
        querier: &'a dyn Query,
        images: impl IntoIterator<Item = (String, PathBuf)>,
    ) -> Self {
        Self {
            loader,
            graph_loader,
            querier,
            images: images.into_iter().collect(),
        }
    }

    /// Load every bundle of the batch.
    ///
    /// Each storage write commits on its own. Once insertion has started, a
    /// failure for one package does not undo bundles already committed for
    /// another package of the same batch.
    pub fn populate(&self, options: PopulateOptions) -> Result<PopulateSummary> {
        let PopulateOptions { mode, overwrite } = options;
        info!(
            "Populating {} bundle(s) in {} mode (overwrite: {})",
            self.images.len(),
            mode,
            overwrite
        );

        let inputs = self.parse_inputs()?;
        let overwrites = self.global_sanity_check(&inputs, options)?;

        let mut summary = PopulateSummary::default();
        match mode {
            Mode::Replaces => self.load_replaces(&inputs, &overwrites, &mut summary)?,
            Mode::SemVer => self.load_semver(&inputs, false, &mut summary)?,
            Mode::SkipPatch => self.load_semver(&inputs, true, &mut summary)?,
        }

        self.loader.clear_non_head_bundles()?;

        info!(
            "Populated {} bundle(s) in {} pass(es), {} overwrite(s)",
            summary.inserted.len(),
            summary.passes,
            summary.overwrites.len()
        );
        Ok(summary)
    }

    /// Parse every directory of the batch, collecting all failures
    fn parse_inputs(&self) -> Result<Vec<ImageInput>> {
        let mut sources: Vec<&(String, PathBuf)> = self.images.iter().collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));

        let results: Vec<Result<ImageInput>> = sources
            .par_iter()
            .map(|(to, from)| ImageInput::new(to.clone(), from.clone()))
            .collect();

        let mut inputs = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(input) => inputs.push(input),
                Err(e) => errors.push(e),
            }
        }
        Error::from_errors(errors)?;

        debug!("Parsed {} bundle(s)", inputs.len());
        Ok(inputs)
    }

    /// Reject duplicates and validate overwrite requests.
    ///
    /// Returns the approved overwrite of each package as an index into
    /// `inputs`.
    fn global_sanity_check(
        &self,
        inputs: &[ImageInput],
        options: PopulateOptions,
    ) -> Result<BTreeMap<String, usize>> {
        if options.overwrite && options.mode != Mode::Replaces {
            return Err(Error::Overwrite(
                "overwrite is only supported in replaces mode".to_string(),
            ));
        }

        let mut errors = Vec::new();
        let mut seen_images = HashSet::new();
        let mut stored_paths: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut overwrites: BTreeMap<String, usize> = BTreeMap::new();

        for (idx, input) in inputs.iter().enumerate() {
            let bundle = &input.bundle;

            if !seen_images.insert(input.to.as_str()) {
                errors.push(Error::BundleImageAlreadyAdded(input.to.clone()));
                continue;
            }

            if !stored_paths.contains_key(bundle.package.as_str()) {
                let paths = not_found_as_empty(self.querier.get_bundle_paths_for_package(&bundle.package))?;
                stored_paths.insert(bundle.package.as_str(), paths.into_iter().collect());
            }
            if stored_paths[bundle.package.as_str()].contains(&input.to) {
                errors.push(Error::BundleImageAlreadyAdded(input.to.clone()));
                continue;
            }

            let Some(existing) = self.stored_bundle(bundle)? else {
                continue;
            };

            if !options.overwrite {
                errors.push(Error::PackageVersionAlreadyAdded {
                    package: bundle.package.clone(),
                    bundle: bundle.name.clone(),
                });
                continue;
            }

            let violations = self.overwrite_violations(bundle, &existing)?;
            if !violations.is_empty() {
                errors.extend(violations);
                continue;
            }

            if overwrites.contains_key(&bundle.package) {
                errors.push(Error::Overwrite(format!(
                    "cannot overwrite more than one bundle at a time for package {}",
                    bundle.package
                )));
                continue;
            }
            overwrites.insert(bundle.package.clone(), idx);
        }

        Error::from_errors(errors)?;
        Ok(overwrites)
    }

    /// The stored bundle of the same package and name, from its first channel
    fn stored_bundle(&self, bundle: &Bundle) -> Result<Option<Bundle>> {
        let mut channels = not_found_as_empty(self.querier.list_channels(&bundle.package))?;
        channels.sort();

        for channel in &channels {
            if let Some(existing) = self.querier.get_bundle(&bundle.package, channel, &bundle.name)? {
                return Ok(Some(existing));
            }
        }
        Ok(None)
    }

    /// Every reason `bundle` may not overwrite `existing`, in a fixed order
    fn overwrite_violations(&self, bundle: &Bundle, existing: &Bundle) -> Result<Vec<Error>> {
        let mut violations = Vec::new();
        let mut violation = |reason: String| violations.push(Error::Overwrite(reason));

        let incoming: BTreeSet<&str> = bundle.channels.iter().map(String::as_str).collect();
        let stored: BTreeSet<&str> = existing.channels.iter().map(String::as_str).collect();
        if incoming != stored {
            violation(format!(
                "channels must match: got {:?}, want {:?}",
                incoming, stored
            ));
        }

        let replaces = bundle.replaces.as_deref().unwrap_or_default();
        let stored_replaces = existing.replaces.as_deref().unwrap_or_default();
        if replaces != stored_replaces {
            violation(format!(
                "replaces must match: got {:?}, want {:?}",
                replaces, stored_replaces
            ));
        }

        if non_empty_set(&bundle.skips) != non_empty_set(&existing.skips) {
            violation("skips must match".to_string());
        }

        let range = bundle.skip_range.as_deref().unwrap_or_default();
        let stored_range = existing.skip_range.as_deref().unwrap_or_default();
        if range != stored_range {
            violation(format!(
                "skip range must match: got {:?}, want {:?}",
                range, stored_range
            ));
        }

        let graph = generate_or_empty(self.graph_loader, &bundle.package)?;
        if let Err(e) = ReplacesGraphLoader::new().check_overwrite(bundle, &graph) {
            violation(format!(
                "version {} cannot take the place of {} {}: {}",
                bundle.version, existing.name, existing.version, e
            ));
        }

        match bundle.default_channel.as_deref().filter(|c| !c.is_empty()) {
            None => violation("a default channel must be specified".to_string()),
            Some(requested) => {
                let stored_default = self.querier.get_default_channel_for_package(&bundle.package)?;
                if stored_default.as_deref() != Some(requested) {
                    violation(format!(
                        "default channel must match: got {:?}, want {:?}",
                        requested,
                        stored_default.unwrap_or_default()
                    ));
                }
            }
        }

        let mut channels: Vec<&String> = existing.channels.iter().collect();
        channels.sort();
        for channel in channels {
            if let Some(replacing) =
                self.querier
                    .get_bundle_that_replaces(&existing.name, &bundle.package, channel)?
            {
                violation(format!(
                    "cannot overwrite {}: it is not the head of channel {} (replaced by {})",
                    existing.name, channel, replacing.name
                ));
            }
        }

        Ok(violations)
    }

    fn load_replaces(
        &self,
        inputs: &[ImageInput],
        overwrites: &BTreeMap<String, usize>,
        summary: &mut PopulateSummary,
    ) -> Result<()> {
        for (package, idx) in overwrites {
            let bundle = &inputs[*idx].bundle;
            info!("Overwriting {} at the head of package {}", bundle.name, package);

            self.loader.clear_bundle(package, &bundle.name)?;
            self.loader.add_operator_bundle(bundle)?;
            self.loader.add_package_channels(&self.translate(bundle)?)?;
            summary.overwrites.push(bundle.name.clone());
        }

        let mut pending: Vec<&Bundle> = inputs
            .iter()
            .enumerate()
            .filter(|(idx, input)| overwrites.get(&input.bundle.package) != Some(idx))
            .map(|(_, input)| &input.bundle)
            .collect();

        while !pending.is_empty() {
            summary.passes += 1;
            let (ready, waiting) = self.next_replaces_batch(&pending, summary.passes)?;

            for bundle in ready {
                let manifest = self.translate(bundle)?;
                self.loader.add_bundle_package_channels(&manifest, bundle)?;
                summary.inserted.push(bundle.name.clone());
            }
            pending = waiting;
        }

        Ok(())
    }

    /// Split pending bundles into those insertable now and those that wait.
    ///
    /// Fails if some package has pending bundles but none insertable.
    fn next_replaces_batch<'b>(
        &self,
        pending: &[&'b Bundle],
        pass: usize,
    ) -> Result<(Vec<&'b Bundle>, Vec<&'b Bundle>)> {
        let mut per_package: BTreeMap<&str, Vec<&'b Bundle>> = BTreeMap::new();
        for bundle in pending {
            per_package.entry(bundle.package.as_str()).or_default().push(*bundle);
        }

        let replaces = ReplacesGraphLoader::new();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        let mut errors = Vec::new();

        for (package, bundles) in per_package {
            let graph = generate_or_empty(self.graph_loader, package)?;
            let mut reasons = Vec::new();
            let mut found = 0;
            // A channel takes at most one new head per pass
            let mut claimed: HashSet<&str> = HashSet::new();

            for bundle in &bundles {
                match replaces.check(bundle, &graph)? {
                    Admission::Ready if bundle.channels.iter().any(|c| claimed.contains(c.as_str())) => {
                        debug!("Deferring {}: a channel it claims already moves this pass", bundle.name);
                        waiting.push(*bundle);
                    }
                    Admission::Ready => {
                        claimed.extend(bundle.channels.iter().map(String::as_str));
                        found += 1;
                        ready.push(*bundle);
                    }
                    Admission::Waiting(reason) => {
                        reasons.push(Error::from(reason));
                        waiting.push(*bundle);
                    }
                }
            }

            info!(
                "Pass {}: package {} has {} insertable and {} waiting bundle(s)",
                pass,
                package,
                found,
                bundles.len() - found
            );

            if found == 0 {
                errors.push(Error::Unsatisfiable {
                    package: package.to_string(),
                    reasons,
                });
            }
        }

        Error::from_errors(errors)?;
        Ok((ready, waiting))
    }

    fn load_semver(
        &self,
        inputs: &[ImageInput],
        skip_patch: bool,
        summary: &mut PopulateSummary,
    ) -> Result<()> {
        let semver = SemverGraphLoader::new();
        if !inputs.is_empty() {
            summary.passes = 1;
        }

        for input in inputs {
            let bundle = &input.bundle;
            let graph = generate_or_empty(self.graph_loader, &bundle.package)?;
            let graph = semver.add_bundle_to_graph(
                bundle,
                graph,
                bundle.default_channel.as_deref(),
                skip_patch,
            )?;

            self.loader.add_bundle_semver(&graph, bundle)?;
            info!("Inserted {} into package {} by version", bundle.name, bundle.package);
            summary.inserted.push(bundle.name.clone());
        }

        Ok(())
    }

    /// Current channel heads with `bundle` overlaid as head of its channels
    fn translate(&self, bundle: &Bundle) -> Result<PackageManifest> {
        let mut existing = Vec::new();
        for channel in not_found_as_empty(self.querier.list_channels(&bundle.package))? {
            let current = self
                .querier
                .get_current_bundle_name_for_channel(&bundle.package, &channel)?;
            existing.push(PackageChannel {
                name: channel,
                current,
            });
        }
        Ok(PackageManifest::translate(bundle, existing))
    }
}

fn not_found_as_empty<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

fn non_empty_set(items: &[String]) -> BTreeSet<&str> {
    items
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect()
}
