use std::fmt;

use url::Url;

use crate::app_state::DomainPolicy;

/// Why a source was refused before (or instead of) being converted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    DomainNotAllowed,
    NotAvifSource,
    SizeUnknown,
    SizeExceeded,
    PixelCountExceeded,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            RejectionReason::DomainNotAllowed => "Source domain is not allowed",
            RejectionReason::NotAvifSource => "Source image is not an AVIF file",
            RejectionReason::SizeUnknown => "Unable to determine source image size",
            RejectionReason::SizeExceeded => "Source image exceeds the size limit",
            RejectionReason::PixelCountExceeded => "Source image exceeds the pixel limit",
        };
        f.write_str(message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject(RejectionReason),
}

/// Outcome of the lightweight size probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeProbe {
    NotProbed,
    Unknown,
    Known(u64),
}

/// What is known about a source at a given point of a conversion attempt.
/// Fields are filled in as the pipeline progresses; rules whose input is
/// not known yet pass.
#[derive(Clone, Debug)]
pub struct SourceDescriptor {
    pub url: Url,
    pub content_length: SizeProbe,
    pub dimensions: Option<(u32, u32)>,
}

impl SourceDescriptor {
    pub fn new(url: Url) -> Self {
        SourceDescriptor {
            url,
            content_length: SizeProbe::NotProbed,
            dimensions: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdmissionLimits {
    pub size_limit: u64,
    pub max_pixels: u64,
    /// Accepted source file suffix, without the dot.
    pub source_extension: String,
    pub domains: DomainPolicy,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        AdmissionLimits {
            size_limit: 10 * 1024 * 1024,
            max_pixels: 2560 * 1440,
            source_extension: "avif".into(),
            domains: DomainPolicy::default(),
        }
    }
}

type Rule = fn(&SourceDescriptor, &AdmissionLimits) -> Option<RejectionReason>;

// Evaluated in order, first failure wins. New limits go at the end of this table.
const RULES: &[(&str, Rule)] = &[
    ("source_domain", check_domain),
    ("source_format", check_format),
    ("size_known", check_size_known),
    ("size_limit", check_size_limit),
    ("pixel_count", check_pixel_count),
];

/// Ordered admission policy. Pure: all I/O (the size probe, the decode)
/// happens in the caller, which re-runs `admit` as the descriptor fills in.
#[derive(Clone, Debug, Default)]
pub struct AdmissionGuard {
    limits: AdmissionLimits,
}

impl AdmissionGuard {
    pub fn new(limits: AdmissionLimits) -> Self {
        AdmissionGuard { limits }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    pub fn check(&self, descriptor: &SourceDescriptor) -> Decision {
        admit(descriptor, &self.limits)
    }
}

pub fn admit(descriptor: &SourceDescriptor, limits: &AdmissionLimits) -> Decision {
    for (name, rule) in RULES {
        if let Some(reason) = rule(descriptor, limits) {
            tracing::debug!(rule = name, url = %descriptor.url, ?reason, "admission rule failed");
            return Decision::Reject(reason);
        }
    }
    Decision::Allow
}

fn check_domain(descriptor: &SourceDescriptor, limits: &AdmissionLimits) -> Option<RejectionReason> {
    // file:// sources come from the local images directory
    let host = descriptor.url.host_str()?;
    (!limits.domains.is_allowed(host)).then_some(RejectionReason::DomainNotAllowed)
}

fn check_format(descriptor: &SourceDescriptor, limits: &AdmissionLimits) -> Option<RejectionReason> {
    let file_name = descriptor
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let matches = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(&limits.source_extension))
        .unwrap_or(false);
    (!matches).then_some(RejectionReason::NotAvifSource)
}

fn check_size_known(descriptor: &SourceDescriptor, _: &AdmissionLimits) -> Option<RejectionReason> {
    (descriptor.content_length == SizeProbe::Unknown).then_some(RejectionReason::SizeUnknown)
}

fn check_size_limit(descriptor: &SourceDescriptor, limits: &AdmissionLimits) -> Option<RejectionReason> {
    match descriptor.content_length {
        SizeProbe::Known(length) if length > limits.size_limit => Some(RejectionReason::SizeExceeded),
        _ => None,
    }
}

fn check_pixel_count(descriptor: &SourceDescriptor, limits: &AdmissionLimits) -> Option<RejectionReason> {
    let (width, height) = descriptor.dimensions?;
    let pixels = u64::from(width) * u64::from(height);
    (pixels > limits.max_pixels).then_some(RejectionReason::PixelCountExceeded)
}
