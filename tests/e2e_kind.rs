use std::error::Error;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const OPERATOR_NAMESPACE: &str = "openshift-cluster-olm-operator";
const CATALOGD_NAMESPACE: &str = "openshift-catalogd";
const RELEASE_VERSION: &str = "4.18.0";
const CLEANUP_FINALIZER: &str = "olm.operator.openshift.io/cleanup";

// ---------------------------------------------------------------------------
// End-to-end install test
//
// Runs the operator binary against a Kind cluster that carries the OpenShift
// config CRDs generated by `crdgen`. Needs `kind`, `kubectl` and `helm` in PATH
// and E2E_ASSETS_DIR pointing at the chart assets.
// Run with: cargo test --test e2e_kind -- --ignored
// ---------------------------------------------------------------------------

/// 1. Start (or reuse) a Kind cluster and install the CRDs.
/// 2. Create the OLM, ClusterVersion and FeatureGate singletons.
/// 3. Start the operator out of cluster.
/// 4. Wait for the sub-component namespaces, the ClusterOperator version and
///    the cleanup finalizer.
/// 5. Switch to `Removed` and wait for the finalizer to go away.
#[test]
#[ignore]
fn e2e_operator_install_and_remove() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl", "helm"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }
    let Ok(assets_dir) = std::env::var("E2E_ASSETS_DIR") else {
        eprintln!("Skipping e2e test: E2E_ASSETS_DIR is not set.");
        return Ok(());
    };

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "cluster-olm-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    let crds = run_cmd(env!("CARGO_BIN_EXE_crdgen"), &[])?;
    kubectl_apply(&crds)?;
    wait_for("CRDs established", Duration::from_secs(60), || {
        Ok(run_cmd(
            "kubectl",
            &[
                "wait",
                "--for=condition=Established",
                "crd/olms.operator.openshift.io",
                "crd/featuregates.config.openshift.io",
                "crd/clusterversions.config.openshift.io",
                "crd/clusteroperators.config.openshift.io",
                "--timeout=10s",
            ],
        )
        .is_ok())
    })?;

    run_cmd(
        "kubectl",
        &[
            "create",
            "namespace",
            OPERATOR_NAMESPACE,
            "--dry-run=client",
            "-o",
            "yaml",
        ],
    )
    .and_then(|output| kubectl_apply(&output))?;

    let _cleanup = Cleanup;
    kubectl_apply(SINGLETONS)?;
    patch_status(
        "clusterversion",
        "version",
        &format!(r#"{{"status":{{"desired":{{"version":"{RELEASE_VERSION}"}}}}}}"#),
    )?;
    patch_status(
        "featuregate",
        "cluster",
        &format!(
            r#"{{"status":{{"featureGates":[{{"version":"{RELEASE_VERSION}","enabled":[],"disabled":[{{"name":"NewOLMPreflightPermissionChecks"}}]}}]}}}}"#
        ),
    )?;

    let manifests_dir = tempfile::tempdir()?;
    let _operator = OperatorProcess::start(&assets_dir, manifests_dir.path().to_path_buf())?;

    wait_for("catalogd namespace created", Duration::from_secs(180), || {
        Ok(run_cmd("kubectl", &["get", "namespace", CATALOGD_NAMESPACE]).is_ok())
    })?;

    wait_for("cleanup finalizer added", Duration::from_secs(60), || {
        let finalizers = run_cmd(
            "kubectl",
            &["get", "olm", "cluster", "-o", "jsonpath={.metadata.finalizers}"],
        )
        .unwrap_or_default();
        Ok(finalizers.contains(CLEANUP_FINALIZER))
    })?;

    wait_for("ClusterOperator reports a version", Duration::from_secs(120), || {
        let version = run_cmd(
            "kubectl",
            &[
                "get",
                "clusteroperator",
                "olm",
                "-o",
                "jsonpath={.status.versions[?(@.name==\"operator\")].version}",
            ],
        )
        .unwrap_or_default();
        Ok(version == RELEASE_VERSION)
    })?;

    let conditions = run_cmd(
        "kubectl",
        &[
            "get",
            "olm",
            "cluster",
            "-o",
            "jsonpath={.status.conditions[*].type}",
        ],
    )?;
    assert!(conditions.contains("CatalogdStaticResourcesDegraded"));

    run_cmd(
        "kubectl",
        &[
            "patch",
            "olm",
            "cluster",
            "--type=merge",
            "-p",
            r#"{"spec":{"managementState":"Removed"}}"#,
        ],
    )?;
    wait_for("cleanup finalizer removed", Duration::from_secs(60), || {
        let finalizers = run_cmd(
            "kubectl",
            &["get", "olm", "cluster", "-o", "jsonpath={.metadata.finalizers}"],
        )
        .unwrap_or_default();
        Ok(!finalizers.contains(CLEANUP_FINALIZER))
    })?;

    Ok(())
}

const SINGLETONS: &str = r#"---
apiVersion: operator.openshift.io/v1
kind: OLM
metadata:
  name: cluster
spec:
  managementState: Managed
---
apiVersion: config.openshift.io/v1
kind: ClusterVersion
metadata:
  name: version
spec: {}
---
apiVersion: config.openshift.io/v1
kind: FeatureGate
metadata:
  name: cluster
spec:
  featureSet: ""
"#;

/// Operator child process, killed when dropped
struct OperatorProcess {
    child: Child,
}

impl OperatorProcess {
    fn start(assets_dir: &str, manifests_dir: PathBuf) -> Result<Self, Box<dyn Error>> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cluster-olm-operator"));
        cmd.args(["start", "--leader-elect=false", "--v=4"])
            .arg(format!("--assets-dir={assets_dir}"))
            .arg(format!("--manifests-dir={}", manifests_dir.display()))
            .env("RELEASE_VERSION", RELEASE_VERSION)
            .env("CATALOGD_IMAGE", "quay.io/operator-framework/catalogd:latest")
            .env(
                "OPERATOR_CONTROLLER_IMAGE",
                "quay.io/operator-framework/operator-controller:latest",
            )
            .env("METRICS_BIND_ADDRESS", "127.0.0.1:0")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        Ok(Self { child: cmd.spawn()? })
    }
}

impl Drop for OperatorProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Deletes what the test created in the cluster
struct Cleanup;

impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "patch",
                "olm",
                "cluster",
                "--type=json",
                "-p",
                r#"[{"op":"remove","path":"/metadata/finalizers"}]"#,
            ],
        );
        let _ = run_cmd_with_stdin_quiet("kubectl", &["delete", "-f", "-"], SINGLETONS);
        for namespace in [OPERATOR_NAMESPACE, CATALOGD_NAMESPACE, "openshift-operator-controller"] {
            let _ = run_cmd_quiet(
                "kubectl",
                &["delete", "namespace", namespace, "--ignore-not-found=true"],
            );
        }
    }
}

fn patch_status(kind: &str, name: &str, patch: &str) -> Result<(), Box<dyn Error>> {
    run_cmd(
        "kubectl",
        &[
            "patch",
            kind,
            name,
            "--subresource=status",
            "--type=merge",
            "-p",
            patch,
        ],
    )
    .map(|_| ())
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)?;
    Ok(())
}

fn wait_for<F>(description: &str, timeout: Duration, mut check: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    loop {
        if check()? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(format!("Timed out waiting for {description}").into());
        }
        sleep(Duration::from_secs(2));
    }
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{program} {args:?} failed: {stderr}").into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{program} {args:?} failed: {stderr}").into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let _ = cmd.output();
    Ok(())
}

fn run_cmd_with_stdin_quiet(
    program: &str,
    args: &[&str],
    input: &str,
) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        let _ = stdin.write_all(input.as_bytes());
    }
    let _ = child.wait_with_output();
    Ok(())
}
