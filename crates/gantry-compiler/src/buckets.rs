use crate::CompileError;
use gantry_model::Package;
use std::collections::HashMap;
use std::sync::Arc;

/// Queue packages in an order that respects the dependency DAG.
///
/// Counter-based topological emission: every package starts with the number
/// of its dependencies that are also in the input (anything else is already
/// compiled and not a real dependency); queuing a package decrements the
/// counters of the packages that use it. Each round queues every package
/// whose counter reached zero, so the input being a DAG guarantees progress;
/// a round without progress means a cycle, which is an error here rather
/// than silent starvation.
///
/// Ruby interpreters dominate wall time and have no dependencies, so
/// packages named `ruby-2.*` are pulled to the front of the queue.
pub fn create_dep_buckets(packages: &[Arc<Package>]) -> Result<Vec<Arc<Package>>, CompileError> {
    let mut buckets: Vec<Arc<Package>> = Vec::with_capacity(packages.len());
    let mut rubies: Vec<Arc<Package>> = Vec::new();

    let mut dep_count: HashMap<&str, i64> = HashMap::with_capacity(packages.len());
    let mut rev_deps: HashMap<&str, Vec<&Arc<Package>>> = HashMap::new();

    for pkg in packages {
        dep_count.insert(pkg.fingerprint.as_str(), 0);
    }
    for pkg in packages {
        for dep in &pkg.dependencies {
            // A dependency outside the input set is already compiled.
            if !dep_count.contains_key(dep.fingerprint.as_str()) {
                continue;
            }
            if let Some(count) = dep_count.get_mut(pkg.fingerprint.as_str()) {
                *count += 1;
            }
            rev_deps
                .entry(dep.fingerprint.as_str())
                .or_default()
                .push(pkg);
        }
    }

    let mut keep_running = true;
    while keep_running {
        keep_running = false;
        for pkg in packages {
            // Still waiting on dependencies (> 0) or already queued (-1).
            if dep_count.get(pkg.fingerprint.as_str()) != Some(&0) {
                continue;
            }
            if let Some(count) = dep_count.get_mut(pkg.fingerprint.as_str()) {
                *count -= 1;
            }
            keep_running = true;

            for user in rev_deps.get(pkg.fingerprint.as_str()).into_iter().flatten() {
                if let Some(count) = dep_count.get_mut(user.fingerprint.as_str()) {
                    *count -= 1;
                }
            }

            if pkg.name.starts_with("ruby-2.") {
                rubies.push(pkg.clone());
            } else {
                buckets.push(pkg.clone());
            }
        }
    }

    if buckets.len() + rubies.len() != packages.len() {
        let mut stuck: Vec<String> = packages
            .iter()
            .filter(|p| dep_count.get(p.fingerprint.as_str()).is_some_and(|c| *c > 0))
            .map(|p| p.name.clone())
            .collect();
        stuck.sort();
        return Err(CompileError::DependencyCycle(stuck));
    }

    rubies.extend(buckets);
    Ok(rubies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_model::PackageRef;
    use std::path::PathBuf;

    fn pkg(name: &str, deps: &[&Arc<Package>]) -> Arc<Package> {
        Arc::new(Package {
            name: name.to_owned(),
            version: "1".to_owned(),
            fingerprint: format!("fp-{name}"),
            sha1: format!("sha-{name}"),
            release_name: "demo".to_owned(),
            release_version: "1".to_owned(),
            path: PathBuf::new(),
            dependencies: deps
                .iter()
                .map(|d| PackageRef {
                    name: d.name.clone(),
                    fingerprint: d.fingerprint.clone(),
                    sha1: d.sha1.clone(),
                })
                .collect(),
        })
    }

    #[test]
    fn topological_order_with_ruby_priority() {
        let a = pkg("a", &[]);
        let b = pkg("b", &[&a]);
        let ruby = pkg("ruby-2.6", &[]);
        let c = pkg("c", &[&b]);

        let order = create_dep_buckets(&[a.clone(), b, ruby, c]).unwrap();
        let names: Vec<&str> = order.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["ruby-2.6", "a", "b", "c"]);
    }

    #[test]
    fn dependencies_outside_input_are_skipped() {
        let compiled = pkg("already-compiled", &[]);
        let a = pkg("a", &[&compiled]);
        let order = create_dep_buckets(&[a]).unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name, "a");
    }

    #[test]
    fn every_package_appears_after_its_dependencies() {
        let base = pkg("base", &[]);
        let lib1 = pkg("lib1", &[&base]);
        let lib2 = pkg("lib2", &[&base]);
        let app = pkg("app", &[&lib1, &lib2]);
        let order =
            create_dep_buckets(&[app.clone(), lib2.clone(), lib1.clone(), base.clone()]).unwrap();

        let pos = |name: &str| order.iter().position(|p| p.name == name).unwrap();
        assert!(pos("base") < pos("lib1"));
        assert!(pos("base") < pos("lib2"));
        assert!(pos("lib1") < pos("app"));
        assert!(pos("lib2") < pos("app"));
    }

    #[test]
    fn cycle_is_an_error_not_a_hang() {
        // Construct a cycle by hand: x depends on y, y depends on x.
        let x_proto = pkg("x", &[]);
        let y = pkg("y", &[&x_proto]);
        let mut x = (*x_proto).clone();
        x.dependencies.push(PackageRef {
            name: y.name.clone(),
            fingerprint: y.fingerprint.clone(),
            sha1: y.sha1.clone(),
        });
        let err = create_dep_buckets(&[Arc::new(x), y]).unwrap_err();
        match err {
            CompileError::DependencyCycle(names) => {
                assert_eq!(names, vec!["x".to_owned(), "y".to_owned()]);
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }
}
