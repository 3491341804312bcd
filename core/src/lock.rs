//! Lock key model.
//!
//! Every contended resource in the store is named by a [`LockResource`]: a
//! [`LockDomain`] plus a numeric identifier. Its [`key`](LockResource::key) is
//! the string the coordination store locks on, for example `lock:product:100`.
//!
//! Transactions that touch several resources accumulate them in a
//! [`LockRequestSet`] and acquire the output of
//! [`build_sorted_keys`](LockRequestSet::build_sorted_keys). Because every
//! caller sorts the same way, two transactions that share keys always take
//! them in the same order and cannot deadlock on each other.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// The closed set of lockable resource domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockDomain {
    /// One user's point wallet.
    Wallet,
    /// One product's stock counter.
    Product,
    /// One issued coupon grant.
    CouponGrant,
    /// Issuance of one coupon definition.
    CouponIssue,
}

impl LockDomain {
    /// Every domain, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Wallet,
        Self::Product,
        Self::CouponGrant,
        Self::CouponIssue,
    ];

    /// Fixed key prefix for this domain.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Wallet => "lock:point:user",
            Self::Product => "lock:product",
            Self::CouponGrant => "lock:coupon:user",
            Self::CouponIssue => "lock:coupon:issue",
        }
    }

    /// Build the resource `(self, id)`.
    #[must_use]
    pub const fn resource(self, id: u64) -> LockResource {
        LockResource::new(self, id)
    }
}

impl fmt::Display for LockDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A single lockable resource.
///
/// Two resources are equal iff both domain and id match. Resources are built
/// per request and never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockResource {
    domain: LockDomain,
    id: u64,
}

impl LockResource {
    /// Create a resource for `domain` and `id`.
    #[must_use]
    pub const fn new(domain: LockDomain, id: u64) -> Self {
        Self { domain, id }
    }

    /// A user's wallet.
    #[must_use]
    pub const fn wallet(user_id: u64) -> Self {
        Self::new(LockDomain::Wallet, user_id)
    }

    /// A product's stock.
    #[must_use]
    pub const fn product(product_id: u64) -> Self {
        Self::new(LockDomain::Product, product_id)
    }

    /// An issued coupon grant.
    #[must_use]
    pub const fn coupon_grant(grant_id: u64) -> Self {
        Self::new(LockDomain::CouponGrant, grant_id)
    }

    /// Issuance of a coupon definition.
    #[must_use]
    pub const fn coupon_issue(coupon_id: u64) -> Self {
        Self::new(LockDomain::CouponIssue, coupon_id)
    }

    /// The resource domain.
    #[must_use]
    pub const fn domain(&self) -> LockDomain {
        self.domain
    }

    /// The resource identifier within its domain.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Canonical lock key: `"{prefix}:{id}"`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.domain.prefix(), self.id)
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain.prefix(), self.id)
    }
}

/// Accumulates the resources one transaction needs to lock.
///
/// Adding the same resource twice is a no-op and insertion order never
/// affects the result of [`build_sorted_keys`](Self::build_sorted_keys).
///
/// # Examples
///
/// ```
/// use storefront_core::lock::LockRequestSet;
///
/// let a = LockRequestSet::new().with_products([3, 1]).with_wallet(9);
/// let b = LockRequestSet::new().with_wallet(9).with_products([1, 3, 3]);
///
/// assert_eq!(a.build_sorted_keys(), b.build_sorted_keys());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockRequestSet {
    resources: HashSet<LockResource>,
}

impl LockRequestSet {
    /// Start an empty request set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the wallet of `user_id`.
    #[must_use]
    pub fn with_wallet(mut self, user_id: u64) -> Self {
        self.resources.insert(LockResource::wallet(user_id));
        self
    }

    /// Add one product resource per id; duplicates collapse.
    #[must_use]
    pub fn with_products<I>(mut self, product_ids: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.resources
            .extend(product_ids.into_iter().map(LockResource::product));
        self
    }

    /// Add the coupon grant, if any.
    #[must_use]
    pub fn with_coupon_grant(mut self, grant_id: Option<u64>) -> Self {
        if let Some(id) = grant_id {
            self.resources.insert(LockResource::coupon_grant(id));
        }
        self
    }

    /// Add the issuance resource of a coupon definition.
    #[must_use]
    pub fn with_coupon_issue(mut self, coupon_id: u64) -> Self {
        self.resources.insert(LockResource::coupon_issue(coupon_id));
        self
    }

    /// Add an arbitrary resource.
    #[must_use]
    pub fn with_resource(mut self, resource: LockResource) -> Self {
        self.resources.insert(resource);
        self
    }

    /// Number of distinct resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True when no resource has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Lexicographically sorted, duplicate-free keys.
    #[must_use]
    pub fn build_sorted_keys(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(LockResource::key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl FromIterator<LockResource> for LockRequestSet {
    fn from_iter<T: IntoIterator<Item = LockResource>>(iter: T) -> Self {
        Self {
            resources: iter.into_iter().collect(),
        }
    }
}
