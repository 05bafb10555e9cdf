//! Traversal library
//!
//! Read-only walks from a datacenter or cluster down the containment tree.
//! References are dereferenced through the store; references whose target
//! has not arrived yet are skipped. Every walk returns each reachable
//! entity once.

use crate::error::Result;
use crate::inventory::model::reference::{CLUSTER, FOLDER, HOST};
use crate::inventory::model::{Cluster, Datacenter, Datastore, Folder, Host, Model, Network, Ref, Vm};
use crate::inventory::store::Store;
use indexmap::IndexSet;
use std::collections::HashSet;
use tracing::debug;

/// Raw standalone host container; stored in the cluster collection
const COMPUTE_RESOURCE: &str = "ComputeResource";

/// Depth-first collection of non-folder references below a folder.
fn walk(store: &Store, root: &Ref, out: &mut IndexSet<Ref>) -> Result<()> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(r) = stack.pop() {
        if r.is_empty() || !visited.insert(r.id.clone()) {
            continue;
        }
        let folder: Folder = match store.find(&r.id) {
            Ok(f) => f,
            Err(e) if e.is_not_found() => {
                debug!(folder = %r, "Folder not yet in inventory");
                continue;
            }
            Err(e) => return Err(e),
        };
        // Reverse so children pop in declared order.
        for child in folder.children.iter().rev() {
            if child.kind == FOLDER {
                stack.push(child.clone());
            }
        }
        for child in folder.children.iter() {
            if child.kind != FOLDER {
                out.insert(child.clone());
            }
        }
    }
    Ok(())
}

/// Dereference `refs`, skipping missing targets.
fn fetch<'a, M: Model>(store: &Store, refs: impl IntoIterator<Item = &'a Ref>) -> Result<Vec<M>> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for r in refs {
        if !seen.insert(r.id.as_str()) {
            continue;
        }
        match store.find::<M>(&r.id) {
            Ok(m) => out.push(m),
            Err(e) if e.is_not_found() => debug!(reference = %r, "Reference target not yet in inventory"),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

fn of_kind<'a>(refs: &'a IndexSet<Ref>, kinds: &'static [&'static str]) -> impl Iterator<Item = &'a Ref> + 'a {
    refs.iter().filter(move |r| kinds.contains(&r.kind.as_str()))
}

fn below(store: &Store, folder: &Ref) -> Result<IndexSet<Ref>> {
    let mut out = IndexSet::new();
    walk(store, folder, &mut out)?;
    Ok(out)
}

fn hosts_of(store: &Store, clusters: &[Cluster]) -> Result<Vec<Host>> {
    fetch(store, clusters.iter().flat_map(|c| c.hosts.iter()))
}

fn vms_of(store: &Store, hosts: &[Host]) -> Result<Vec<Vm>> {
    fetch(store, hosts.iter().flat_map(|h| h.vms.iter()))
}

impl Datacenter {
    /// VMs under the VM folder.
    pub fn vm_list(&self, store: &Store) -> Result<Vec<Vm>> {
        let refs = below(store, &self.vm_folder)?;
        fetch(store, of_kind(&refs, &[Vm::KIND]))
    }

    /// Clusters and standalone compute resources under the host folder.
    pub fn cluster_list(&self, store: &Store) -> Result<Vec<Cluster>> {
        let refs = below(store, &self.host_folder)?;
        fetch(store, of_kind(&refs, &[CLUSTER, COMPUTE_RESOURCE]))
    }

    /// Hosts of every cluster plus hosts placed directly in folders.
    pub fn host_list(&self, store: &Store) -> Result<Vec<Host>> {
        let refs = below(store, &self.host_folder)?;
        let clusters: Vec<Cluster> = fetch(store, of_kind(&refs, &[CLUSTER, COMPUTE_RESOURCE]))?;
        let mut host_refs: Vec<&Ref> = clusters.iter().flat_map(|c| c.hosts.iter()).collect();
        host_refs.extend(of_kind(&refs, &[HOST]));
        fetch(store, host_refs)
    }

    pub fn net_list(&self, store: &Store) -> Result<Vec<Network>> {
        let refs = below(store, &self.net_folder)?;
        fetch(store, of_kind(&refs, &[Network::KIND]))
    }

    pub fn ds_list(&self, store: &Store) -> Result<Vec<Datastore>> {
        let refs = below(store, &self.ds_folder)?;
        fetch(store, of_kind(&refs, &[Datastore::KIND]))
    }
}

impl Cluster {
    pub fn host_list(&self, store: &Store) -> Result<Vec<Host>> {
        hosts_of(store, std::slice::from_ref(self))
    }

    /// VMs running on the cluster's hosts.
    pub fn vm_list(&self, store: &Store) -> Result<Vec<Vm>> {
        let hosts = self.host_list(store)?;
        vms_of(store, &hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::model::RefList;

    fn folder(store: &Store, id: &str, children: &[Ref]) {
        let mut f = Folder::with_id(id);
        f.children = children.iter().cloned().collect::<RefList>();
        store.insert(&mut f).unwrap();
    }

    fn simple<M: Model>(store: &Store, id: &str) {
        let mut m = M::with_id(id);
        store.insert(&mut m).unwrap();
    }

    /// dc-1 with nested VM folders, one cluster with two hosts, one
    /// standalone host and a dangling VM reference.
    fn inventory() -> (Store, Datacenter) {
        let store = Store::new("traversal");
        let mut dc = Datacenter::with_id("datacenter-1");
        dc.vm_folder = Ref::new(FOLDER, "group-v1");
        dc.host_folder = Ref::new(FOLDER, "group-h1");
        dc.net_folder = Ref::new(FOLDER, "group-n1");
        dc.ds_folder = Ref::new(FOLDER, "group-s1");
        store.insert(&mut dc).unwrap();

        folder(
            &store,
            "group-v1",
            &[Ref::new(VM_KIND, "vm-1"), Ref::new(FOLDER, "group-v2"), Ref::new(VM_KIND, "vm-missing")],
        );
        folder(&store, "group-v2", &[Ref::new(VM_KIND, "vm-2"), Ref::new(FOLDER, "group-v2")]);
        simple::<Vm>(&store, "vm-1");
        simple::<Vm>(&store, "vm-2");
        simple::<Vm>(&store, "vm-3");

        folder(
            &store,
            "group-h1",
            &[Ref::new(CLUSTER, "domain-c1"), Ref::new(COMPUTE_RESOURCE, "domain-s1")],
        );
        let mut cluster = Cluster::with_id("domain-c1");
        cluster.hosts.push(Ref::new(HOST, "host-1"));
        cluster.hosts.push(Ref::new(HOST, "host-2"));
        store.insert(&mut cluster).unwrap();
        let mut standalone = Cluster::with_id("domain-s1");
        standalone.hosts.push(Ref::new(HOST, "host-3"));
        store.insert(&mut standalone).unwrap();

        let mut h1 = Host::with_id("host-1");
        h1.vms.push(Ref::new(VM_KIND, "vm-1"));
        store.insert(&mut h1).unwrap();
        let mut h2 = Host::with_id("host-2");
        h2.vms.push(Ref::new(VM_KIND, "vm-2"));
        h2.vms.push(Ref::new(VM_KIND, "vm-3"));
        store.insert(&mut h2).unwrap();
        simple::<Host>(&store, "host-3");

        folder(&store, "group-n1", &[Ref::new("Network", "network-1"), Ref::new("Network", "dvportgroup-1")]);
        simple::<Network>(&store, "network-1");
        simple::<Network>(&store, "dvportgroup-1");
        folder(&store, "group-s1", &[Ref::new("Datastore", "datastore-1")]);
        simple::<Datastore>(&store, "datastore-1");

        (store, dc)
    }

    const VM_KIND: &str = "VM";

    #[test]
    fn test_datacenter_lists() {
        let (store, dc) = inventory();

        let vms: Vec<String> = dc.vm_list(&store).unwrap().into_iter().map(|v| v.base.id).collect();
        assert_eq!(vms, vec!["vm-1", "vm-2"]);

        assert_eq!(dc.cluster_list(&store).unwrap().len(), 2);
        assert_eq!(dc.host_list(&store).unwrap().len(), 3);
        assert_eq!(dc.net_list(&store).unwrap().len(), 2);
        assert_eq!(dc.ds_list(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_cluster_lists() {
        let (store, _) = inventory();
        let cluster: Cluster = store.find("domain-c1").unwrap();
        assert_eq!(cluster.host_list(&store).unwrap().len(), 2);
        let vms = cluster.vm_list(&store).unwrap();
        assert_eq!(vms.len(), 3);
    }

    #[test]
    fn test_traversal_does_not_mutate() {
        let (store, dc) = inventory();
        let before = store.stats();
        dc.vm_list(&store).unwrap();
        dc.host_list(&store).unwrap();
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn test_missing_folder_yields_empty() {
        let store = Store::new("empty");
        let mut dc = Datacenter::with_id("datacenter-9");
        dc.vm_folder = Ref::new(FOLDER, "group-gone");
        assert!(dc.vm_list(&store).unwrap().is_empty());
        assert!(dc.ds_list(&store).unwrap().is_empty());
    }
}
