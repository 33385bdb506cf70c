mod common;

use std::sync::Arc;
use std::thread;

use dxgkrnl::{
    AllocationCreateInfo, AllocationDesc, AllocationFlags, CpuWaitInfo, Error, Handle,
    SharedResource, SignalFlags, SyncObjectCreateInfo, SyncObjectFlags, SyncObjectType,
};

use common::{device, guest};

fn shared_request(device: Handle, flags: AllocationFlags) -> AllocationCreateInfo {
    AllocationCreateInfo {
        flags: AllocationFlags::CREATE_RESOURCE | AllocationFlags::CREATE_SHARED | flags,
        allocations: (0..3u8)
            .map(|i| AllocationDesc {
                private_data: vec![i; 8 + i as usize],
                page_count: 1,
            })
            .collect(),
        resource_private_data: b"resource".to_vec(),
        runtime_private_data: b"runtime data".to_vec(),
        ..AllocationCreateInfo::new(device)
    }
}

fn anchor_of(process: &Arc<dxgkrnl::Process>, resource: Handle) -> Arc<SharedResource> {
    process
        .resource(resource)
        .expect("resource")
        .shared()
        .cloned()
        .expect("shared anchor")
}

#[test]
fn test_open_global_shared_resource() {
    let g = guest();
    let (a, device_a) = device(&g.registry, 1);
    let (b, device_b) = device(&g.registry, 2);

    let created = g
        .registry
        .create_allocation(&a, &shared_request(device_a, AllocationFlags::empty()))
        .expect("create shared resource");
    let global = created.global_share.expect("global share");
    let anchor = anchor_of(&a, created.resource.expect("resource"));
    assert!(!anchor.is_sealed());

    let info = g
        .registry
        .query_resource_info(&b, device_b, global)
        .expect("query");
    assert!(anchor.is_sealed());
    assert_eq!(info.allocation_count, 3);
    assert_eq!(info.resource_private_data_size, 8);
    assert_eq!(info.runtime_private_data_size, 12);
    assert_eq!(info.allocation_private_data_size, 8 + 9 + 10);

    let opened = g
        .registry
        .open_resource(&b, device_b, global)
        .expect("open shared resource");
    assert_eq!(opened.allocations.len(), 3);
    assert_eq!(opened.data.resource_private_data, b"resource");
    assert_eq!(opened.data.runtime_private_data, b"runtime data");
    for (i, data) in opened.data.allocation_private_data.iter().enumerate() {
        assert_eq!(data, &vec![i as u8; 8 + i]);
        let allocation = b.allocation(opened.allocations[i]).expect("opened allocation");
        assert_eq!(allocation.private_data(), data.as_slice());
    }
    assert_eq!(anchor.participant_count(), 2);
    assert_eq!(g.host.live_resources(), 2);

    // Sealed: the creator can no longer add allocations.
    assert_eq!(
        g.registry.create_allocation(
            &a,
            &AllocationCreateInfo {
                resource: created.resource,
                allocations: vec![AllocationDesc::default()],
                ..AllocationCreateInfo::new(device_a)
            },
        ),
        Err(Error::Sealed)
    );

    // The anchor outlives the creator while another participant remains.
    let adapter = g.registry.adapters()[0].clone();
    g.registry.process_destroy(&a);
    assert_eq!(anchor.participant_count(), 1);
    assert_eq!(adapter.shared_object_count(), 1);
    assert!(g.registry.query_resource_info(&b, device_b, global).is_ok());

    g.registry.process_destroy(&b);
    assert_eq!(anchor.reference_count(), 0);
    assert_eq!(adapter.shared_object_count(), 0);
    assert_eq!(g.host.live_objects(), 0);
}

#[test]
fn test_concurrent_opens_share_one_anchor() {
    let g = guest();
    let (a, device_a) = device(&g.registry, 1);
    let created = g
        .registry
        .create_allocation(&a, &shared_request(device_a, AllocationFlags::empty()))
        .expect("create shared resource");
    let global = created.global_share.expect("global share");
    let anchor = anchor_of(&a, created.resource.expect("resource"));

    let openers: Vec<_> = (0..3u32)
        .map(|i| {
            let registry = g.registry.clone();
            thread::spawn(move || {
                let (process, device) = device(&registry, 10 + i);
                let opened = registry
                    .open_resource(&process, device, global)
                    .expect("open shared resource");
                assert_eq!(opened.allocations.len(), 3);
                process
            })
        })
        .collect();
    let processes: Vec<_> = openers
        .into_iter()
        .map(|t| t.join().expect("opener panicked"))
        .collect();

    assert!(anchor.is_sealed());
    assert_eq!(anchor.participant_count(), 4);
    assert_eq!(anchor.allocation_count(), 3);
    assert_eq!(g.registry.adapters()[0].shared_object_count(), 1);

    for process in &processes {
        g.registry.process_destroy(process);
    }
    g.registry.process_destroy(&a);
    assert_eq!(anchor.reference_count(), 0);
    assert_eq!(g.host.live_objects(), 0);
}

#[test]
fn test_descriptor_redeemed_once() {
    let g = guest();
    let (a, device_a) = device(&g.registry, 1);
    let (b, device_b) = device(&g.registry, 2);

    let created = g
        .registry
        .create_allocation(
            &a,
            &shared_request(device_a, AllocationFlags::NT_SECURITY_SHARING),
        )
        .expect("create nt shared resource");
    assert_eq!(created.global_share, None);
    let resource = created.resource.expect("resource");
    let anchor = anchor_of(&a, resource);
    assert_eq!(g.host.live_nt_objects(), 0);

    let descriptors = g
        .registry
        .share_objects(&a, &[resource])
        .expect("share");
    assert_eq!(descriptors.len(), 1);
    assert!(anchor.is_sealed());
    assert_eq!(anchor.host_nt_references(), 1);
    assert_eq!(g.host.live_nt_objects(), 1);
    assert_eq!(g.registry.descriptor_count(), 1);

    let info = g
        .registry
        .query_resource_info_from_descriptor(&b, device_b, descriptors[0])
        .expect("query through descriptor");
    assert_eq!(info.allocation_count, 3);
    assert_eq!(g.registry.descriptor_count(), 1);

    g.registry
        .open_resource_from_descriptor(&b, device_b, descriptors[0])
        .expect("redeem");
    assert_eq!(g.registry.descriptor_count(), 0);
    assert_eq!(
        g.registry
            .open_resource_from_descriptor(&b, device_b, descriptors[0])
            .err(),
        Some(Error::InvalidHandle)
    );
    assert_eq!(anchor.host_nt_references(), 1);

    // The opened participant holds the host NT object, not the creator.
    g.registry.process_destroy(&a);
    assert_eq!(g.host.live_nt_objects(), 1);
    g.registry.process_destroy(&b);
    assert_eq!(g.host.live_nt_objects(), 0);
    assert_eq!(anchor.reference_count(), 0);
}

#[test]
fn test_share_requires_descriptor_sharing() {
    let g = guest();
    let (a, device_a) = device(&g.registry, 1);

    let global = g
        .registry
        .create_allocation(&a, &shared_request(device_a, AllocationFlags::empty()))
        .expect("create shared resource");
    let nt = g
        .registry
        .create_allocation(
            &a,
            &shared_request(device_a, AllocationFlags::NT_SECURITY_SHARING),
        )
        .expect("create nt shared resource");
    let nt_resource = nt.resource.expect("resource");

    // Devices can never be shared.
    assert_eq!(
        g.registry.share_objects(&a, &[device_a]).err(),
        Some(Error::NotSupported)
    );

    // All or nothing: the bad handle fails the whole call.
    assert_eq!(
        g.registry
            .share_objects(&a, &[nt_resource, global.resource.expect("resource")])
            .err(),
        Some(Error::InvalidParameter)
    );
    assert_eq!(g.registry.descriptor_count(), 0);
    assert_eq!(anchor_of(&a, nt_resource).host_nt_references(), 0);
    assert_eq!(g.host.live_nt_objects(), 0);

    let descriptors = g
        .registry
        .share_objects(&a, &[nt_resource, nt_resource])
        .expect("share twice");
    assert_eq!(anchor_of(&a, nt_resource).host_nt_references(), 2);
    for descriptor in descriptors {
        g.registry.close_descriptor(descriptor).expect("close");
    }
    assert_eq!(g.registry.descriptor_count(), 0);
    assert_eq!(g.host.live_nt_objects(), 0);
}

#[test]
fn test_shared_fence_seen_by_both_processes() {
    let g = guest();
    let (a, device_a) = device(&g.registry, 1);
    let (b, device_b) = device(&g.registry, 2);

    let created = g
        .registry
        .create_sync_object(
            &a,
            &SyncObjectCreateInfo {
                flags: SyncObjectFlags::SHARED,
                ..SyncObjectCreateInfo::new(device_a, SyncObjectType::MonitoredFence)
            },
        )
        .expect("create shared fence");
    let global = created.global_share.expect("global share");

    let opened = g
        .registry
        .open_sync_object(&b, device_b, global, SyncObjectFlags::empty())
        .expect("open shared fence");
    let anchor = b
        .sync_object(opened)
        .expect("opened fence")
        .shared()
        .cloned()
        .expect("shared anchor");
    assert_eq!(anchor.participant_count(), 2);

    g.registry
        .signal_sync_object_cpu(&a, device_a, &[created.sync_object], &[5], SignalFlags::empty())
        .expect("signal");

    g.registry
        .wait_sync_object_cpu(
            &b,
            &CpuWaitInfo {
                device: device_b,
                objects: vec![opened],
                fence_values: vec![5],
                flags: SignalFlags::empty(),
                event: None,
                timeout: Some(std::time::Duration::from_secs(5)),
            },
        )
        .expect("wait through the opened fence");

    g.registry.destroy_sync_object(&a, created.sync_object).expect("destroy");
    assert_eq!(anchor.participant_count(), 1);
    g.registry.destroy_sync_object(&b, opened).expect("destroy");
    assert_eq!(anchor.reference_count(), 0);
    assert_eq!(g.registry.adapters()[0].shared_object_count(), 0);
}
