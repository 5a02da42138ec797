// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classpath inputs and class loader resource resolution.

use crate::content::FileDeltaOracle;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use retest_metadata::{
    ClassLoaderScopes, ClasspathContents, Fingerprint, LocatedPath, ResourceFingerprints,
    RunSnapshot,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Derives a class name from a class file path relative to its classpath origin.
///
/// The extension is stripped and path separators become `.`: `com/example/FooTest.class` maps to
/// `com.example.FooTest`.
pub fn class_name_for_path(rel: &Utf8Path) -> String {
    let without_extension = rel.with_extension("");
    let mut out = String::with_capacity(without_extension.as_str().len());
    for component in without_extension.components() {
        if let Utf8Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(part);
        }
    }
    out
}

/// The class files on each classpath for the current session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClasspathInputs {
    /// Classes under test.
    pub user: ClasspathContents,

    /// Test classes. Every class on this classpath is a candidate test.
    pub test: ClasspathContents,

    /// The test runner's own classes.
    pub test_runner: ClasspathContents,
}

impl ClasspathInputs {
    /// Returns every class on the test classpath, keyed by its identifying key.
    pub fn test_classes(&self) -> BTreeMap<LocatedPath, String> {
        let mut out = BTreeMap::new();
        for (origin, files) in &self.test {
            for rel in files.keys() {
                out.insert(origin.join(rel), class_name_for_path(rel));
            }
        }
        out
    }

    /// Returns the names of every class on the user and test classpaths.
    pub fn known_classes(&self) -> BTreeSet<String> {
        self.user
            .values()
            .chain(self.test.values())
            .flat_map(|files| files.keys())
            .map(|rel| class_name_for_path(rel))
            .collect()
    }

    /// Returns the class loader scopes workers should set up for these classpaths.
    pub fn class_loader_scopes(&self) -> ClassLoaderScopes {
        ClassLoaderScopes {
            user: self.user.keys().cloned().collect(),
            test: self.test.keys().cloned().collect(),
            test_runner: self.test_runner.keys().cloned().collect(),
        }
    }

    /// Copies these classpaths into `snapshot`.
    pub fn store_into(&self, snapshot: &mut RunSnapshot) {
        snapshot.user_classpath = self.user.clone();
        snapshot.test_classpath = self.test.clone();
        snapshot.test_runner_classpath = self.test_runner.clone();
    }
}

/// A resource looked up through a classpath origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedResource {
    /// The file that backs the resource.
    pub file: Utf8PathBuf,

    /// The fingerprint of the resource as seen through this origin.
    pub fingerprint: Fingerprint,
}

/// Resolves class loader resources for a single classpath origin.
pub trait ResourceResolver: fmt::Debug + Send + Sync {
    /// Looks up a resource by name, fingerprinting the backing file through `files`.
    ///
    /// Returns `None` if this origin can't provide resources of that name at all.
    fn resolve(&self, name: &str, files: &dyn FileDeltaOracle) -> Option<ResolvedResource>;
}

/// Resolves resources as files under a directory.
#[derive(Clone, Debug)]
pub struct DirectoryResolver {
    root: Utf8PathBuf,
}

impl DirectoryResolver {
    /// Creates a resolver for the given directory.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceResolver for DirectoryResolver {
    fn resolve(&self, name: &str, files: &dyn FileDeltaOracle) -> Option<ResolvedResource> {
        let rel = Utf8Path::new(name);
        // Resource names are always forward-relative.
        if !rel
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_)))
        {
            return None;
        }
        let file = self.root.join(rel);
        let fingerprint = files.current_fingerprint(&file);
        Some(ResolvedResource { file, fingerprint })
    }
}

/// Resolves every resource to the archive file itself.
///
/// Entries inside archives aren't tracked individually: any change to the archive counts as a
/// change to every resource looked up through it.
#[derive(Clone, Debug)]
pub struct ArchiveResolver {
    archive: Utf8PathBuf,
}

impl ArchiveResolver {
    /// Creates a resolver for the given archive.
    pub fn new(archive: impl Into<Utf8PathBuf>) -> Self {
        Self {
            archive: archive.into(),
        }
    }
}

impl ResourceResolver for ArchiveResolver {
    fn resolve(&self, _name: &str, files: &dyn FileDeltaOracle) -> Option<ResolvedResource> {
        Some(ResolvedResource {
            file: self.archive.clone(),
            fingerprint: files.current_fingerprint(&self.archive),
        })
    }
}

/// Resource resolvers for every classpath origin visible to tests.
#[derive(Debug, Default)]
pub struct ClasspathResources {
    resolvers: BTreeMap<LocatedPath, Box<dyn ResourceResolver>>,
}

impl ClasspathResources {
    /// Creates an empty set of resolvers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolvers for every origin on the given classpaths: [`ArchiveResolver`] for `.jar`
    /// and `.zip` files, [`DirectoryResolver`] for everything else.
    pub fn for_classpaths(inputs: &ClasspathInputs) -> Self {
        let mut out = Self::new();
        for origin in inputs
            .user
            .keys()
            .chain(inputs.test.keys())
            .chain(inputs.test_runner.keys())
        {
            let resolver: Box<dyn ResourceResolver> = match origin.path().extension() {
                Some("jar" | "zip") => Box::new(ArchiveResolver::new(origin.path())),
                _ => Box::new(DirectoryResolver::new(origin.path())),
            };
            out.insert(origin.clone(), resolver);
        }
        out
    }

    /// Adds or replaces the resolver for an origin.
    pub fn insert(&mut self, origin: LocatedPath, resolver: Box<dyn ResourceResolver>) {
        self.resolvers.insert(origin, resolver);
    }

    /// Looks up a resource through every origin.
    ///
    /// Returns one fingerprint per origin, with [`Fingerprint::NotFound`] for origins that don't
    /// contain it, along with the files backing the resource where it was found.
    pub fn resolve_all(
        &self,
        name: &str,
        files: &dyn FileDeltaOracle,
    ) -> (ResourceFingerprints, Vec<ResolvedResource>) {
        let mut fingerprints = ResourceFingerprints::new();
        let mut found = Vec::new();
        for (origin, resolver) in &self.resolvers {
            match resolver.resolve(name, files) {
                Some(resolved) => {
                    fingerprints.insert(origin.clone(), resolved.fingerprint);
                    if resolved.fingerprint.exists() {
                        found.push(resolved);
                    }
                }
                None => {
                    fingerprints.insert(origin.clone(), Fingerprint::NotFound);
                }
            }
        }
        (fingerprints, found)
    }

    /// Returns the first origin whose fingerprint for `name` differs from `stored`.
    ///
    /// Origins that were added or removed since `stored` was recorded count as changes.
    pub fn changed_origin<'a>(
        &'a self,
        name: &str,
        stored: &'a ResourceFingerprints,
        files: &dyn FileDeltaOracle,
    ) -> Option<&'a LocatedPath> {
        if let Some(removed) = stored
            .keys()
            .find(|origin| !self.resolvers.contains_key(*origin))
        {
            return Some(removed);
        }
        self.resolvers.iter().find_map(|(origin, resolver)| {
            let Some(previous) = stored.get(origin) else {
                return Some(origin);
            };
            let current = resolver
                .resolve(name, files)
                .map_or(Fingerprint::NotFound, |resolved| resolved.fingerprint);
            (current != *previous).then_some(origin)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentStore, LocalContentStore};
    use camino_tempfile::Utf8TempDir;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("com/example/FooTest.class", "com.example.FooTest"; "nested")]
    #[test_case("Top.class", "Top"; "top level")]
    #[test_case("com/example/Outer$Inner.class", "com.example.Outer$Inner"; "inner class")]
    fn class_names(path: &str, expected: &str) {
        assert_eq!(class_name_for_path(Utf8Path::new(path)), expected);
    }

    #[test]
    fn test_classes_are_keyed_by_path() {
        let inputs = ClasspathInputs {
            test: btreemap! {
                LocatedPath::execution("/out/test") => btreemap! {
                    "com/example/FooTest.class".into() => Fingerprint::Content { hash: 1, len: 1 },
                },
                LocatedPath::local("/other/test") => btreemap! {
                    "com/example/FooTest.class".into() => Fingerprint::Content { hash: 2, len: 1 },
                },
            },
            ..Default::default()
        };
        assert_eq!(
            inputs.test_classes(),
            btreemap! {
                LocatedPath::execution("/out/test/com/example/FooTest.class") => "com.example.FooTest".to_owned(),
                LocatedPath::local("/other/test/com/example/FooTest.class") => "com.example.FooTest".to_owned(),
            },
            "same-named classes on different origins are distinct tests"
        );
    }

    #[test]
    fn resources_across_origins() {
        let with_resource = Utf8TempDir::new().unwrap();
        let without_resource = Utf8TempDir::new().unwrap();
        std::fs::create_dir(with_resource.path().join("META-INF")).unwrap();
        std::fs::write(with_resource.path().join("META-INF/config"), "v1").unwrap();

        let a = LocatedPath::local(with_resource.path());
        let b = LocatedPath::local(without_resource.path());
        let mut resources = ClasspathResources::new();
        resources.insert(a.clone(), Box::new(DirectoryResolver::new(with_resource.path())));
        resources.insert(
            b.clone(),
            Box::new(DirectoryResolver::new(without_resource.path())),
        );

        let (fingerprints, found) =
            resources.resolve_all("META-INF/config", &LocalContentStore::new());
        assert_eq!(fingerprints.len(), 2, "one entry per origin");
        assert_eq!(fingerprints[&b], Fingerprint::NotFound);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file, with_resource.path().join("META-INF/config"));

        // A fresh store each time, so every check sees the files as they are now.
        let changed_origin = || {
            resources
                .changed_origin("META-INF/config", &fingerprints, &LocalContentStore::new())
                .cloned()
        };
        assert_eq!(changed_origin(), None);

        std::fs::write(with_resource.path().join("META-INF/config"), "v2").unwrap();
        assert_eq!(changed_origin(), Some(a));

        // A resource appearing in an origin where it was absent is a change too.
        std::fs::write(with_resource.path().join("META-INF/config"), "v1").unwrap();
        std::fs::create_dir(without_resource.path().join("META-INF")).unwrap();
        std::fs::write(without_resource.path().join("META-INF/config"), "shadow").unwrap();
        assert_eq!(changed_origin(), Some(b));
    }

    #[test]
    fn archives_are_fingerprinted_through_the_store() {
        let dir = Utf8TempDir::new().unwrap();
        let archive = dir.path().join("lib.jar");
        std::fs::write(&archive, "jar v1").unwrap();
        let origin = LocatedPath::local(&archive);
        let mut resources = ClasspathResources::new();
        resources.insert(origin.clone(), Box::new(ArchiveResolver::new(&archive)));

        let store = LocalContentStore::new();
        let (first, found) = resources.resolve_all("a.properties", &store);
        assert_eq!(found[0].file, archive);

        // Later lookups, for any name, use the store's cached fingerprint.
        std::fs::write(&archive, "jar v2, rebuilt").unwrap();
        let (second, _) = resources.resolve_all("b.properties", &store);
        assert_eq!(second[&origin], first[&origin]);
        assert_eq!(resources.changed_origin("a.properties", &first, &store), None);

        store.invalidate(&archive);
        assert_eq!(
            resources.changed_origin("a.properties", &first, &store),
            Some(&origin)
        );
    }

    #[test]
    fn added_and_removed_origins() {
        let dir = Utf8TempDir::new().unwrap();
        let origin = LocatedPath::local(dir.path());
        let mut resources = ClasspathResources::new();
        resources.insert(origin.clone(), Box::new(DirectoryResolver::new(dir.path())));
        let store = LocalContentStore::new();

        let stored_elsewhere = btreemap! {
            LocatedPath::local("/gone") => Fingerprint::NotFound,
        };
        assert_eq!(
            resources.changed_origin("x", &stored_elsewhere, &store),
            Some(&LocatedPath::local("/gone")),
            "removed origin"
        );
        assert_eq!(
            resources.changed_origin("x", &ResourceFingerprints::new(), &store),
            Some(&origin),
            "added origin"
        );
    }

    #[test]
    fn resource_names_must_be_forward_relative() {
        let resolver = DirectoryResolver::new("/classes");
        let store = LocalContentStore::new();
        assert_eq!(resolver.resolve("../secret", &store), None);
        assert_eq!(resolver.resolve("/etc/passwd", &store), None);
    }
}
