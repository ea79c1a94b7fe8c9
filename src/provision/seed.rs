//! cloud-init documents for first boot.

use crate::driver::SeedPayload;

/// Guest-side account setup.
#[derive(Clone, Copy)]
pub struct GuestConfig<'a> {
    pub hostname: &'a str,
    pub root_password: &'a str,
    /// Secondary sudo account and its password.
    pub user: Option<(&'a str, &'a str)>,
    pub allow_root_login: bool,
}

pub fn render(guest: &GuestConfig<'_>) -> SeedPayload {
    SeedPayload {
        user_data: user_data(guest),
        meta_data: format!(
            "instance-id: {host}\nlocal-hostname: {host}\n",
            host = guest.hostname
        ),
    }
}

fn user_data(guest: &GuestConfig<'_>) -> String {
    let mut doc = String::from("#cloud-config\n");
    doc.push_str(&format!("hostname: {}\n", guest.hostname));
    doc.push_str("ssh_pwauth: true\npackage_update: true\npackage_upgrade: false\n\n");

    doc.push_str("users:\n  - default\n");
    if let Some((name, _)) = guest.user {
        doc.push_str(&format!(
            "  - name: {name}\n    sudo: ['ALL=(ALL) NOPASSWD:ALL']\n    groups: [sudo, wheel, users, admin]\n    shell: /bin/bash\n    lock_passwd: false\n"
        ));
    }

    doc.push_str("\nchpasswd:\n  list: |\n");
    doc.push_str(&format!("    root:{}\n", guest.root_password));
    if let Some((name, password)) = guest.user {
        doc.push_str(&format!("    {name}:{password}\n"));
    }
    doc.push_str("  expire: false\n\n");

    doc.push_str(&format!(
        "write_files:\n  - path: /etc/ssh/sshd_config.d/99-custom.conf\n    permissions: '0644'\n    content: |\n      PermitRootLogin {}\n      PasswordAuthentication yes\n      KbdInteractiveAuthentication yes\n      PubkeyAuthentication yes\n\n",
        if guest.allow_root_login { "yes" } else { "no" }
    ));

    doc.push_str("runcmd:\n  - [ systemctl, daemon-reload ]\n");
    doc.push_str(
        "  - [ sh, -c, \"systemctl restart sshd 2>/dev/null || systemctl restart ssh 2>/dev/null || true\" ]\n",
    );
    doc
}
