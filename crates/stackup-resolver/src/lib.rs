mod cache;
mod resolve;
mod source;
mod strategy;

pub use cache::{CacheEntry, VersionCache};
pub use resolve::{Resolution, ResolutionOrigin, VersionResolver};
pub use source::{FeedDocument, FeedRelease, Release, ReleaseSource, SourceLocation, UpstreamSources};
pub use strategy::{
    LatestStrategy, LtsStrategy, PinnedStrategy, RangeStrategy, ResolutionStrategy,
    StrategyRegistry,
};
