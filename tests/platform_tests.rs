//! Tests for host architecture detection and naming.

use changes_lxc::Arch;

#[test]
fn test_detect_matches_build_target() {
    let arch = Arch::detect();

    #[cfg(target_arch = "x86_64")]
    assert_eq!(arch, Arch::Amd64);

    #[cfg(target_arch = "aarch64")]
    assert_eq!(arch, Arch::Arm64);

    assert_eq!(Arch::default(), arch);
}

#[test]
fn test_display_uses_lxc_name() {
    assert_eq!(Arch::Amd64.to_string(), "amd64");
    assert_eq!(Arch::I386.to_string(), "i386");
    assert_eq!(Arch::Armhf.to_string(), "armhf");
}

#[test]
fn test_unknown_arch_falls_back_to_amd64_cache_layout() {
    assert_eq!(Arch::Unknown.lxc_name(), "amd64");
    assert_eq!(Arch::Unknown.personality(), "x86_64");
}
