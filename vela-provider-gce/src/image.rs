//! Image reference resolution
//!
//! A configured image can be spelled ten different ways, from a full URL down
//! to a bare name. URL and path forms resolve syntactically; shorthand forms
//! need existence checks against the caller's project and then the public
//! vendor projects. Image lookups always run before family lookups, so a name
//! shared by an image and a family resolves to the image.

use std::sync::LazyLock;

use regex::Regex;

use crate::api::client::ComputeApi;
use crate::util::relative_path;
use vela_core::provider::{ProviderError, ProviderResult};

const PROJECT_PATTERN: &str = "[a-z0-9-]*";
const NAME_PATTERN: &str = "[-_a-zA-Z0-9]*";

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^https://www\\.googleapis\\.com/compute/[a-z0-9]+/projects/({PROJECT_PATTERN})/global/images/({NAME_PATTERN})"
    ))
    .unwrap()
});
static PROJECT_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "projects/({PROJECT_PATTERN})/global/images/({NAME_PATTERN})$"
    ))
    .unwrap()
});
static PROJECT_FAMILY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "projects/({PROJECT_PATTERN})/global/images/family/({NAME_PATTERN})$"
    ))
    .unwrap()
});
static GLOBAL_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^global/images/({NAME_PATTERN})$")).unwrap());
static GLOBAL_FAMILY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^global/images/family/({NAME_PATTERN})$")).unwrap());
static FAMILY_FAMILY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^family/({NAME_PATTERN})$")).unwrap());
static PROJECT_IMAGE_SHORTHAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^({PROJECT_PATTERN})/({NAME_PATTERN})$")).unwrap());
static PROJECT_FAMILY_SHORTHAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^({PROJECT_PATTERN})/({NAME_PATTERN})$")).unwrap());
static BARE_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^({NAME_PATTERN})$")).unwrap());
static BARE_FAMILY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^({NAME_PATTERN})$")).unwrap());

// Vendor naming schemes whose published family names are not substrings of
// their image names
static UBUNTU_LTS_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^ubuntu-(minimal-)?([0-9]+)(?:.*(arm64))?.*$").unwrap());
static WINDOWS_SQL_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "^sql-(?:server-)?([0-9]{4})-([a-z]+)-windows-(?:server-)?([0-9]{4})(?:-r([0-9]+))?-dc-v[0-9]+$",
    )
    .unwrap()
});

/// Public projects hosting well-known OS images, looked up by substring of
/// the configured name
const IMAGE_VENDOR_PROJECTS: &[(&str, &str)] = &[
    ("centos", "centos-cloud"),
    ("coreos", "coreos-cloud"),
    ("debian", "debian-cloud"),
    ("opensuse", "opensuse-cloud"),
    ("rhel", "rhel-cloud"),
    ("rocky-linux", "rocky-linux-cloud"),
    ("sles", "suse-cloud"),
    ("ubuntu", "ubuntu-os-cloud"),
    ("windows", "windows-cloud"),
    ("windows-sql", "windows-sql-cloud"),
];

/// The longest matching substring wins, so a "windows-sql" name is checked
/// against windows-sql-cloud rather than windows-cloud
fn vendor_project(name: &str) -> Option<&'static str> {
    IMAGE_VENDOR_PROJECTS
        .iter()
        .filter(|(substring, _)| name.contains(substring))
        .max_by_key(|(substring, _)| substring.len())
        .map(|(_, project)| *project)
}

async fn image_exists(api: &dyn ComputeApi, project: &str, name: &str) -> ProviderResult<bool> {
    match api.get_image(project, name).await {
        Ok(_) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(ProviderError::remote(
            format!("checking if image {} exists", name),
            err,
        )),
    }
}

async fn family_exists(api: &dyn ComputeApi, project: &str, family: &str) -> ProviderResult<bool> {
    match api.get_image_from_family(project, family).await {
        Ok(_) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(ProviderError::remote(
            format!("checking if family {} exists", family),
            err,
        )),
    }
}

fn unresolved(name: &str) -> ProviderError {
    ProviderError::not_found(format!("image or family {}", name))
}

/// Resolve a configured image reference to a canonical path
///
/// Unambiguous forms resolve without touching the API. Shorthand forms probe
/// the caller's project first and the matching vendor project second, image
/// before family at each step.
pub async fn resolve_image(
    api: &dyn ComputeApi,
    project: &str,
    name: &str,
) -> ProviderResult<String> {
    let vendor = vendor_project(name);

    if LINK.is_match(name) {
        return Ok(name.to_string());
    }
    // A family path never matches PROJECT_IMAGE because the name class
    // excludes '/', so image-before-family ordering is safe here.
    if let Some(caps) = PROJECT_IMAGE.captures(name) {
        return Ok(format!("projects/{}/global/images/{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = PROJECT_FAMILY.captures(name) {
        return Ok(format!(
            "projects/{}/global/images/family/{}",
            &caps[1], &caps[2]
        ));
    }
    if let Some(caps) = GLOBAL_IMAGE.captures(name) {
        return Ok(format!("global/images/{}", &caps[1]));
    }
    if let Some(caps) = GLOBAL_FAMILY.captures(name) {
        return Ok(format!("global/images/family/{}", &caps[1]));
    }
    if let Some(caps) = FAMILY_FAMILY.captures(name) {
        let family = caps[1].to_string();
        if family_exists(api, project, &family).await? {
            return Ok(format!("global/images/family/{}", family));
        }
        if let Some(vendor) = vendor
            && family_exists(api, vendor, &family).await?
        {
            return Ok(format!("projects/{}/global/images/family/{}", vendor, family));
        }
        return Err(unresolved(name));
    }
    if let Some(caps) = PROJECT_IMAGE_SHORTHAND.captures(name) {
        let named_project = caps[1].to_string();
        let image = caps[2].to_string();
        if image_exists(api, &named_project, &image).await? {
            return Ok(format!("projects/{}/global/images/{}", named_project, image));
        }
        if let Some(caps) = PROJECT_FAMILY_SHORTHAND.captures(name) {
            let named_project = caps[1].to_string();
            let family = caps[2].to_string();
            if family_exists(api, &named_project, &family).await? {
                return Ok(format!(
                    "projects/{}/global/images/family/{}",
                    named_project, family
                ));
            }
        }
        return Err(unresolved(name));
    }
    if let Some(caps) = BARE_IMAGE.captures(name) {
        let candidate = caps[1].to_string();
        if image_exists(api, project, &candidate).await? {
            return Ok(format!("global/images/{}", candidate));
        }
        if let Some(vendor) = vendor
            && image_exists(api, vendor, &candidate).await?
        {
            return Ok(format!("projects/{}/global/images/{}", vendor, candidate));
        }
        if BARE_FAMILY.is_match(name) {
            if family_exists(api, project, &candidate).await? {
                return Ok(format!("global/images/family/{}", candidate));
            }
            if let Some(vendor) = vendor
                && family_exists(api, vendor, &candidate).await?
            {
                return Ok(format!(
                    "projects/{}/global/images/family/{}",
                    vendor, candidate
                ));
            }
        }
    }
    Err(unresolved(name))
}

/// Coerce a resolved image reference into the relative `projects/...` form
/// used in persisted state; caller-project forms pick up `provider_project`
pub fn resolve_image_ref_to_relative_uri(
    provider_project: &str,
    name: &str,
) -> ProviderResult<String> {
    if LINK.is_match(name) {
        return Ok(relative_path(name));
    }
    if let Some(caps) = PROJECT_IMAGE.captures(name) {
        return Ok(format!("projects/{}/global/images/{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = PROJECT_FAMILY.captures(name) {
        return Ok(format!(
            "projects/{}/global/images/family/{}",
            &caps[1], &caps[2]
        ));
    }
    if let Some(caps) = GLOBAL_IMAGE.captures(name) {
        return Ok(format!(
            "projects/{}/global/images/{}",
            provider_project, &caps[1]
        ));
    }
    if let Some(caps) = GLOBAL_FAMILY.captures(name) {
        return Ok(format!(
            "projects/{}/global/images/family/{}",
            provider_project, &caps[1]
        ));
    }
    Err(ProviderError::invalid_input(
        "image",
        format!("could not expand {:?} into a relative URI", name),
    ))
}

/// Whether a configured image reference still denotes the image the service
/// reports
///
/// The live side is always the concrete `projects/{project}/global/images/
/// {name}` form. A configured family matches when the image name embeds the
/// family name; the Ubuntu LTS and Windows naming schemes get dedicated
/// checks because their family names do not appear in their image names. An
/// actual family rollover (the family now points at a different image) is
/// indistinguishable without a lookup and reports as equal here.
pub fn image_references_equal(live: &str, configured: &str) -> bool {
    let live = relative_path(live);
    let Some(caps) = PROJECT_IMAGE.captures(&live) else {
        return false;
    };
    let live_project = caps[1].to_string();
    let live_name = caps[2].to_string();

    if let Some(caps) = PROJECT_FAMILY.captures(configured) {
        return projects_equal(&live_project, &caps[1]) && family_matches(&live_name, &caps[2]);
    }
    if let Some(caps) = PROJECT_IMAGE.captures(configured) {
        return projects_equal(&live_project, &caps[1]) && live_name == caps[2];
    }
    if let Some(caps) = GLOBAL_FAMILY.captures(configured) {
        return family_matches(&live_name, &caps[1]);
    }
    if let Some(caps) = GLOBAL_IMAGE.captures(configured) {
        return live_name == caps[1];
    }
    if let Some(caps) = FAMILY_FAMILY.captures(configured) {
        return family_matches(&live_name, &caps[1]);
    }
    if let Some(caps) = PROJECT_IMAGE_SHORTHAND.captures(configured) {
        return projects_equal(&live_project, &caps[1])
            && (live_name == caps[2] || family_matches(&live_name, &caps[2]));
    }
    live_name == configured || family_matches(&live_name, configured)
}

/// Project comparison that accepts the vendor shorthand ("centos" for
/// centos-cloud) on the configured side
fn projects_equal(live: &str, configured: &str) -> bool {
    let configured = IMAGE_VENDOR_PROJECTS
        .iter()
        .find(|(alias, _)| *alias == configured)
        .map(|(_, project)| *project)
        .unwrap_or(configured);
    live == configured
}

fn family_matches(image: &str, family: &str) -> bool {
    // debian-9-drawfork-v20180109 belongs to family debian-9
    if image.contains(family) {
        return true;
    }
    if ubuntu_lts_family(image).as_deref() == Some(family) {
        return true;
    }
    if windows_sql_family(image).as_deref() == Some(family) {
        return true;
    }
    windows_family_matches(image, family)
}

// ubuntu-1404-trusty-v20180122 -> ubuntu-1404-lts
fn ubuntu_lts_family(image: &str) -> Option<String> {
    let caps = UBUNTU_LTS_IMAGE.captures(image)?;
    let minimal = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let version = &caps[2];
    Some(match caps.get(3) {
        Some(arch) => format!("ubuntu-{}{}-lts-{}", minimal, version, arch.as_str()),
        None => format!("ubuntu-{}{}-lts", minimal, version),
    })
}

// sql-2017-standard-windows-2016-dc-v20180109 -> sql-std-2017-win-2016
fn windows_sql_family(image: &str) -> Option<String> {
    let caps = WINDOWS_SQL_IMAGE.captures(image)?;
    let edition = match &caps[2] {
        "enterprise" => "ent",
        "standard" => "std",
        "express" => "exp",
        other => other,
    };
    Some(match caps.get(4) {
        Some(revision) => format!(
            "sql-{}-{}-win-{}-r{}",
            edition,
            &caps[1],
            &caps[3],
            revision.as_str()
        ),
        None => format!("sql-{}-{}-win-{}", edition, &caps[1], &caps[3]),
    })
}

// windows-server-1709-dc-core-v20180109 belongs to family windows-1709-core
fn windows_family_matches(image: &str, family: &str) -> bool {
    let rewritten = family
        .replacen("windows-", "windows-server-", 1)
        .replacen("-core", "-dc-core", 1);
    image.contains(&rewritten)
}
