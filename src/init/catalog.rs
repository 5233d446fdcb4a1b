//! The fragment catalogue: what each component does at boot.
//!
//! Every optional fragment is self-contained. It only relies on what the base
//! fragment has already set up (pseudo filesystems, tmpfs areas, network).

use crate::features::Feature;
use crate::layout::{LIGHTTPD_CONF, RUNTIME_PORT, SEED_FILE, SERVICE_USER};
use crate::staging::ServiceAccount;

use super::fragment::{Fragment, FragmentKind, ServiceUnit, Step};

/// Kernel parameters applied at boot. Failure of any one is fail-open.
pub const HARDENING_SYSCTLS: &[(&str, &str)] = &[
    ("kernel.kptr_restrict", "2"),
    ("kernel.dmesg_restrict", "1"),
    ("kernel.unprivileged_bpf_disabled", "1"),
    ("kernel.yama.ptrace_scope", "2"),
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.all.accept_redirects", "0"),
    ("net.ipv4.conf.all.send_redirects", "0"),
    ("net.ipv4.tcp_syncookies", "1"),
];

/// Writable tmpfs areas on top of the read-only root: (mount point, mode, extra options).
const TMPFS_AREAS: &[(&str, &str, &str)] = &[
    ("/tmp", "1777", ""),
    ("/run", "0755", ""),
    ("/var/log", "0755", ",noexec"),
    ("/var/tmp", "1777", ""),
];

/// Primary network interface brought up by the base fragment.
pub const PRIMARY_IFACE: &str = "eth0";

/// Readiness budget for the database engine.
pub const DB_READY_ATTEMPTS: u32 = 30;
pub const DB_READY_DELAY_SECS: u32 = 1;

const PG_DATA: &str = "/var/lib/postgresql/data";

/// Always-present first fragment.
pub fn base() -> Fragment {
    let mut steps = vec![
        Step::closed(
            "mount-proc",
            "mountpoint -q /proc || mount -t proc -o nosuid,nodev,noexec proc /proc",
        ),
        Step::closed(
            "mount-sys",
            "mountpoint -q /sys || mount -t sysfs -o nosuid,nodev,noexec sysfs /sys",
        ),
        Step::closed(
            "mount-dev",
            "mountpoint -q /dev || mount -t devtmpfs -o nosuid,mode=0755 devtmpfs /dev",
        ),
    ];

    for (target, mode, extra) in TMPFS_AREAS {
        let name = format!("tmpfs{}", target.replace('/', "-"));
        steps.push(Step::closed(
            &name,
            format!("mount -t tmpfs -o nosuid,nodev,mode={mode}{extra} tmpfs {target}"),
        ));
    }

    steps.push(Step::closed("remount-root-ro", "mount -o remount,ro /"));

    steps.push(Step::open("loopback-up", "ip link set lo up"));
    steps.push(Step::open(
        "iface-up",
        format!("ip link set {PRIMARY_IFACE} up"),
    ));
    steps.push(Step::open(
        "dhcp",
        format!("udhcpc -i {PRIMARY_IFACE} -q -n -t 5 -S"),
    ));

    for (key, value) in HARDENING_SYSCTLS {
        steps.push(Step::open(
            &format!("sysctl-{key}"),
            format!("sysctl -q -w {key}={value}"),
        ));
    }

    Fragment {
        kind: FragmentKind::Base,
        steps,
        unit: None,
        post: vec![],
    }
}

/// Fragment for an enabled optional component.
pub fn optional(feature: Feature) -> Fragment {
    match feature {
        Feature::Discovery => discovery(),
        Feature::Runtime => runtime(),
        Feature::Database => database(),
    }
}

fn discovery() -> Fragment {
    Fragment {
        kind: FragmentKind::Optional(Feature::Discovery),
        steps: vec![
            Step::open(
                "machine-id",
                "mkdir -p /run/dbus && dbus-uuidgen > /run/machine-id",
            ),
            Step::open("dbus", "dbus-daemon --system"),
        ],
        unit: Some(ServiceUnit::background(10, "avahi-daemon -D --no-chroot")),
        post: vec![],
    }
}

fn runtime() -> Fragment {
    Fragment {
        kind: FragmentKind::Optional(Feature::Runtime),
        steps: vec![],
        unit: Some(ServiceUnit::background(
            20,
            format!(
                "if [ -f /srv/app/server.js ]; then su -s /bin/sh {SERVICE_USER} -c 'cd /srv/app && PORT={RUNTIME_PORT} DATABASE_HOST=127.0.0.1 exec node server.js'; fi"
            ),
        )),
        post: vec![],
    }
}

fn database() -> Fragment {
    Fragment {
        kind: FragmentKind::Optional(Feature::Database),
        steps: vec![
            Step::open(
                "pg-scratch",
                "mount -t tmpfs -o nosuid,nodev,size=256m,mode=0700 tmpfs /var/lib/postgresql",
            ),
            Step::open(
                "pg-dirs",
                "mkdir -p /run/postgresql && chown postgres:postgres /var/lib/postgresql /run/postgresql",
            ),
            Step::open(
                "pg-initdb",
                format!(
                    "su -s /bin/sh postgres -c 'initdb -D {PG_DATA} -U postgres --auth=trust' > /dev/null"
                ),
            ),
            Step::open(
                "pg-hba",
                format!(
                    "printf 'local all all trust\\nhost all all 127.0.0.1/32 trust\\nhost all all ::1/128 trust\\n' > {PG_DATA}/pg_hba.conf"
                ),
            ),
        ],
        unit: Some(ServiceUnit::foreground(
            30,
            format!(
                "su -s /bin/sh postgres -c \"pg_ctl -D {PG_DATA} -l /var/lib/postgresql/server.log -o '-c listen_addresses=localhost' start\" > /dev/null"
            ),
            true,
        )),
        post: vec![
            Step::poll(
                "pg-ready",
                "pg_isready -q -h 127.0.0.1",
                DB_READY_ATTEMPTS,
                DB_READY_DELAY_SECS,
            ),
            // Absent seed data is skipped without a message.
            Step::open(
                "pg-seed",
                format!("psql -q -h 127.0.0.1 -U postgres -f {SEED_FILE} > /dev/null"),
            )
            .when(format!("[ -f {SEED_FILE} ]")),
        ],
    }
}

/// Always-present last fragment: the file server replaces the sequencer.
///
/// `owner` is the service account as provisioned in the image, which may
/// predate the build with its own ids.
pub fn terminal(owner: ServiceAccount) -> Fragment {
    Fragment {
        kind: FragmentKind::Terminal,
        steps: vec![Step::open(
            "lighttpd-dirs",
            format!(
                "mkdir -p /var/log/lighttpd /run/lighttpd && chown {}:{} /var/log/lighttpd /run/lighttpd",
                owner.uid, owner.gid
            ),
        )],
        unit: Some(ServiceUnit::terminal(format!("lighttpd -D -f /{LIGHTTPD_CONF}"))),
        post: vec![],
    }
}
