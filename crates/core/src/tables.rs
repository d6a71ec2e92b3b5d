//! Fixed type-identity tables: the exclusion denylist and the apply priority order.

use rustc_hash::FxHashSet;

use crate::Gvk;

/// Compile-time GVK entry used by the built-in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticGvk {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

const fn gvk(group: &'static str, version: &'static str, kind: &'static str) -> StaticGvk {
    StaticGvk { group, version, kind }
}

impl From<StaticGvk> for Gvk {
    fn from(s: StaticGvk) -> Self {
        Gvk::new(s.group, s.version, s.kind)
    }
}

/// Types applied first, in this order, before anything else is considered.
pub const DEFAULT_PRIORITY: &[StaticGvk] = &[
    gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
    gvk("", "v1", "Namespace"),
    gvk("", "v1", "Node"),
    gvk("config.openshift.io", "v1", "ClusterOperator"),
    gvk("config.openshift.io", "v1", "ClusterVersion"),
];

/// Types never replayed: unsafe, meaningless outside the original cluster, or confidential.
pub const DEFAULT_EXCLUSIONS: &[StaticGvk] = &[
    gvk("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration"),
    gvk("", "v1", "Secret"),
    gvk("", "v1", "Service"),
    gvk("batch", "v1", "Job"),
    gvk("build.openshift.io", "v1", "BuildConfig"),
    gvk("build.openshift.io", "v1", "Build"),
    gvk("cns.vmware.com", "v1alpha1", "CnsVolumeOperationRequest"),
    gvk("cns.vmware.com", "v1alpha1", "CSINodeTopology"),
    gvk("oauth.openshift.io", "v1", "OAuthClient"),
    gvk("operators.coreos.com", "v1", "OperatorGroup"),
    gvk("apiregistration.k8s.io", "v1", "APIService"),
    gvk("route.openshift.io", "v1", "RouteList"),
    gvk("route.openshift.io", "v1", "Route"),
    gvk("user.openshift.io", "v1", "User"),
    gvk("metrics.k8s.io", "v1beta1", "Metrics"),
    gvk("template.openshift.io", "v1", "Template"),
];

#[derive(Debug, Clone, Default)]
pub struct ExclusionTable {
    set: FxHashSet<Gvk>,
}

impl ExclusionTable {
    pub fn new<I: IntoIterator<Item = Gvk>>(items: I) -> Self {
        Self { set: items.into_iter().collect() }
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.set.contains(gvk)
    }

    pub fn extend<I: IntoIterator<Item = Gvk>>(&mut self, items: I) {
        self.set.extend(items);
    }

    pub fn len(&self) -> usize { self.set.len() }
    pub fn is_empty(&self) -> bool { self.set.is_empty() }
}

#[derive(Debug, Clone, Default)]
pub struct PriorityList {
    order: Vec<Gvk>,
}

impl PriorityList {
    pub fn new<I: IntoIterator<Item = Gvk>>(items: I) -> Self {
        let mut order: Vec<Gvk> = Vec::new();
        for g in items {
            if !order.contains(&g) { order.push(g); }
        }
        Self { order }
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.order.iter().any(|g| g == gvk)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gvk> {
        self.order.iter()
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

/// Immutable configuration tables handed to the loader and the reconciler.
#[derive(Debug, Clone)]
pub struct Tables {
    pub priority: PriorityList,
    pub exclusions: ExclusionTable,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            priority: PriorityList::new(DEFAULT_PRIORITY.iter().copied().map(Gvk::from)),
            exclusions: ExclusionTable::new(DEFAULT_EXCLUSIONS.iter().copied().map(Gvk::from)),
        }
    }
}

impl Tables {
    pub fn with_extra_exclusions<I: IntoIterator<Item = Gvk>>(mut self, extra: I) -> Self {
        self.exclusions.extend(extra);
        self
    }
}
