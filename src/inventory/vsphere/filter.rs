//! Property filter
//!
//! The watched object tree and the exact property set tracked per managed
//! object type.

use super::xml::escape;

/// Name of the recursive folder traversal
const FOLDER_TRAVERSAL: &str = "folderTraversal";
/// VMs of a vApp
const VAPP_VM_TRAVERSAL: &str = "vAppVmTraversal";
/// Nested vApps and resource pools of a vApp
const VAPP_CHILD_TRAVERSAL: &str = "vAppChildTraversal";

// =============================================================================
// Property sets
// =============================================================================

pub const NAME: &str = "name";
pub const PARENT: &str = "parent";

/// Properties tracked per raw managed object type
pub fn property_sets() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        ("Folder", vec![NAME, PARENT, "childEntity"]),
        (
            "Datacenter",
            vec![NAME, PARENT, "vmFolder", "hostFolder", "networkFolder", "datastoreFolder"],
        ),
        ("ClusterComputeResource", vec![NAME, PARENT, "host", "datastore", "network"]),
        ("ComputeResource", vec![NAME, PARENT, "host", "datastore", "network"]),
        (
            "HostSystem",
            vec![
                NAME,
                PARENT,
                "config.product.name",
                "config.product.version",
                "summary.runtime.inMaintenanceMode",
                "datastore",
                "network",
                "vm",
            ],
        ),
        ("Network", vec![NAME, PARENT, "tag", "summary.accessible"]),
        (
            "DistributedVirtualPortgroup",
            vec![NAME, PARENT, "tag", "key", "config.distributedVirtualSwitch"],
        ),
        (
            "Datastore",
            vec![
                NAME,
                PARENT,
                "summary.type",
                "summary.capacity",
                "summary.freeSpace",
                "summary.maintenanceMode",
            ],
        ),
        (
            "VirtualMachine",
            vec![
                NAME,
                PARENT,
                "config.uuid",
                "config.firmware",
                "config.template",
                "config.changeTrackingEnabled",
                "config.guestFullName",
                "config.hardware.numCPU",
                "config.hardware.memoryMB",
                "config.hardware.device",
                "runtime.powerState",
                "runtime.host",
                "parentVApp",
                "snapshot",
            ],
        ),
    ]
}

// =============================================================================
// Traversal
// =============================================================================

/// (name, type, path, nested selections). `StoragePod` is a `Folder`
/// subtype, so the folder traversal descends into datastore clusters.
fn traversals() -> Vec<(&'static str, &'static str, &'static str, Vec<&'static str>)> {
    let all = vec![
        FOLDER_TRAVERSAL,
        "dcVmTraversal",
        "dcHostTraversal",
        "dcNetworkTraversal",
        "dcDatastoreTraversal",
        "clusterHostTraversal",
        "computeHostTraversal",
        VAPP_VM_TRAVERSAL,
        VAPP_CHILD_TRAVERSAL,
    ];
    vec![
        (FOLDER_TRAVERSAL, "Folder", "childEntity", all),
        ("dcVmTraversal", "Datacenter", "vmFolder", vec![FOLDER_TRAVERSAL]),
        ("dcHostTraversal", "Datacenter", "hostFolder", vec![FOLDER_TRAVERSAL]),
        ("dcNetworkTraversal", "Datacenter", "networkFolder", vec![FOLDER_TRAVERSAL]),
        ("dcDatastoreTraversal", "Datacenter", "datastoreFolder", vec![FOLDER_TRAVERSAL]),
        ("clusterHostTraversal", "ClusterComputeResource", "host", vec![]),
        ("computeHostTraversal", "ComputeResource", "host", vec![]),
        (VAPP_VM_TRAVERSAL, "VirtualApp", "vm", vec![]),
        (
            VAPP_CHILD_TRAVERSAL,
            "VirtualApp",
            "resourcePool",
            vec![VAPP_VM_TRAVERSAL, VAPP_CHILD_TRAVERSAL],
        ),
    ]
}

/// Render the `PropertyFilterSpec` rooted at `root_folder`.
pub fn filter_spec(root_folder: &str) -> String {
    let mut out = String::from("<spec>");
    for (kind, paths) in property_sets() {
        out.push_str(&format!("<propSet><type>{}</type><all>false</all>", kind));
        for path in paths {
            out.push_str(&format!("<pathSet>{}</pathSet>", path));
        }
        out.push_str("</propSet>");
    }
    out.push_str(&format!(
        "<objectSet><obj type=\"Folder\">{}</obj><skip>false</skip>",
        escape(root_folder)
    ));
    for (name, kind, path, nested) in traversals() {
        out.push_str(&format!(
            "<selectSet xsi:type=\"TraversalSpec\"><name>{}</name><type>{}</type><path>{}</path><skip>false</skip>",
            name, kind, path
        ));
        for n in nested {
            out.push_str(&format!("<selectSet><name>{}</name></selectSet>", n));
        }
        out.push_str("</selectSet>");
    }
    out.push_str("</objectSet></spec>");
    out
}
