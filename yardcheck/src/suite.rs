//! The verification suite: the phase table and the context its phases share.

use std::io::Write;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::core::checks::{check_socket_stat, dir_presence, fragment, resolved, total_packet_loss};
use crate::core::commands::{
    Engine, Provisioner, account_lookup, dir_probe, firewall_rules, link_show, preflight_cleanup,
    remove_tree, residue_cleanup, service_active, service_start, service_stop, socket_stat,
};
use crate::core::instance::{Instance, joined_labels};
use crate::core::probe::{ProbeResult, all_ok, failure_summary};
use crate::core::report::{Summary, format_summary_line};
use crate::dispatch::{for_all, for_all_staggered};
use crate::io::config::HarnessConfig;
use crate::io::poll::poll_command;
use crate::io::remote::{Connect, Remote, RemoteOutput, SESSION_FAILED_EXIT, upload};
use crate::isolation::check_isolation;
use crate::recorder::Recorder;
use crate::sequencer::{PhaseGroup, PhasePlan, run_plan};

/// State shared by every phase of one run.
pub struct SuiteContext<C: Connect> {
    pub connector: C,
    pub channel: C::Channel,
    pub config: HarnessConfig,
    /// The fixed tenant set.
    pub instances: Vec<Instance>,
    /// Tenants not yet torn down.
    pub surviving: Vec<Instance>,
    tool: String,
}

impl<C: Connect> SuiteContext<C> {
    pub fn new(connector: C, channel: C::Channel, config: HarnessConfig) -> Self {
        let instances = config.instances.clone();
        Self {
            connector,
            channel,
            tool: config.remote_tool(),
            surviving: instances.clone(),
            instances,
            config,
        }
    }

    fn provisioner(&self) -> Provisioner<'_> {
        Provisioner::new(&self.tool)
    }

    /// Run `command` and turn a non-zero exit into an error.
    fn require(&self, command: &str) -> Result<RemoteOutput> {
        let out = self.channel.run(command);
        if out.success() {
            Ok(out)
        } else {
            bail!(
                "exit {}: {}",
                out.exit_code,
                fragment(&out.combined(), self.config.output_limit_bytes)
            )
        }
    }

    fn forget(&mut self, inst: &Instance) {
        self.surviving.retain(|s| s.label != inst.label);
    }
}

/// Probe-level equivalent of [`SuiteContext::require`].
fn probe_ok(out: &RemoteOutput, limit: usize) -> Result<(), String> {
    if out.success() {
        Ok(())
    } else {
        Err(format!("exit {}: {}", out.exit_code, fragment(&out.combined(), limit)))
    }
}

fn expect_stdout(out: &RemoteOutput, marker: &str, limit: usize) -> Result<(), String> {
    probe_ok(out, limit)?;
    if out.stdout.trim() == marker {
        Ok(())
    } else {
        Err(format!("expected {marker:?}, got {:?}", fragment(&out.stdout, limit)))
    }
}

fn expect_connectivity(out: &RemoteOutput, limit: usize) -> Result<(), String> {
    probe_ok(out, limit)?;
    if total_packet_loss(&out.stdout) {
        return Err(format!("no replies: {}", fragment(&out.stdout, limit)));
    }
    Ok(())
}

fn expect_all(results: &[ProbeResult]) -> Result<()> {
    if all_ok(results) {
        Ok(())
    } else {
        bail!("{}", failure_summary(results))
    }
}

fn dind_name(inst: &Instance) -> String {
    inst.workload("dind")
}

/// Start a nested engine in `name` on `inst` and wait until it answers.
fn start_nested<R: Remote + ?Sized>(
    remote: &R,
    inst: &Instance,
    name: &str,
    cfg: &HarnessConfig,
) -> Result<(), String> {
    let engine = Engine::for_instance(inst);
    let _ = remote.run(&engine.remove(name));
    probe_ok(
        &remote.run(&engine.run_detached(name, &cfg.nested_image, "")),
        cfg.output_limit_bytes,
    )?;
    poll_command(remote, cfg.nested_ready_budget(), || engine.exec(name, "docker info"))
        .map_err(|err| format!("nested engine in {name}: {err}"))?;
    Ok(())
}

fn nested_workload<R: Remote + ?Sized>(
    remote: &R,
    inst: &Instance,
    name: &str,
    cfg: &HarnessConfig,
) -> Result<(), String> {
    let inner = format!("docker run --rm {} echo inner-hello", cfg.workload_image);
    let out = remote.run(&Engine::for_instance(inst).exec(name, &inner));
    expect_stdout(&out, "inner-hello", cfg.output_limit_bytes)
}

fn nested_ping<R: Remote + ?Sized>(
    remote: &R,
    inst: &Instance,
    name: &str,
    cfg: &HarnessConfig,
) -> Result<(), String> {
    let inner = format!("docker run --rm {} ping -c 3 {}", cfg.workload_image, cfg.ping_target);
    let out = remote.run(&Engine::for_instance(inst).exec(name, &inner));
    expect_connectivity(&out, cfg.output_limit_bytes)
}

fn services_active<R: Remote + ?Sized>(
    remote: &R,
    instances: &[Instance],
    limit: usize,
) -> Result<()> {
    let results = for_all(remote, instances, |r, inst| {
        let service = inst.service();
        let state = r.run(&service_active(&service));
        if state.exit_code == SESSION_FAILED_EXIT {
            return Err(format!(
                "could not query {service}: {}",
                fragment(&state.combined(), limit)
            ));
        }
        match state.stdout.trim() {
            "active" => Ok(()),
            other => Err(format!(
                "{service} is {other:?} (exit {}): {}",
                state.exit_code,
                fragment(&state.combined(), limit)
            )),
        }
    });
    expect_all(&results)
}

fn workload_runs<R: Remote + ?Sized>(
    remote: &R,
    cfg: &HarnessConfig,
    instances: &[Instance],
) -> Result<()> {
    let results = for_all(remote, instances, |r, inst| {
        let out = r.run(&Engine::for_instance(inst).run_once(&cfg.workload_image, "echo hello"));
        expect_stdout(&out, "hello", cfg.output_limit_bytes)
    });
    expect_all(&results)
}

fn outbound_ping<R: Remote + ?Sized>(
    remote: &R,
    cfg: &HarnessConfig,
    instances: &[Instance],
) -> Result<()> {
    let args = format!("ping -c 3 {}", cfg.ping_target);
    let results = for_all(remote, instances, |r, inst| {
        let out = r.run(&Engine::for_instance(inst).run_once(&cfg.workload_image, &args));
        expect_connectivity(&out, cfg.output_limit_bytes)
    });
    expect_all(&results)
}

/// Everything an instance leaves behind once destroyed, as problems found.
///
/// Every check here passes when its target is absent, so a command whose
/// session never opened is reported instead of read as absence.
fn residue<R: Remote + ?Sized>(
    remote: &R,
    inst: &Instance,
    thorough: bool,
    limit: usize,
) -> Vec<String> {
    let service = inst.service();
    let bridge = inst.bridge();
    let mut problems = Vec::new();
    let mut query = |what: &str, command: &str| {
        let out = remote.run(command);
        if out.exit_code == SESSION_FAILED_EXIT {
            problems.push(format!("could not check {what}: {}", fragment(&out.stderr, limit)));
            return None;
        }
        Some(out)
    };

    let mut found = Vec::new();
    let state = query(service.as_str(), &service_active(&service));
    if state.is_some_and(|out| out.stdout.trim() == "active") {
        found.push(format!("service {service} still active"));
    }
    if query(bridge.as_str(), &link_show(&bridge)).is_some_and(|out| out.success()) {
        found.push(format!("bridge {bridge} still present"));
    }
    let rules = query(inst.prefix.as_str(), &firewall_rules(&inst.prefix));
    if rules.is_some_and(|out| !out.stdout.trim().is_empty()) {
        found.push(format!("iptables rules for {} remain", inst.prefix));
    }
    if thorough {
        let sysbox = format!("{}/run/sysbox", inst.root);
        for dir in [inst.root.as_str(), sysbox.as_str()] {
            let Some(out) = query(dir, &dir_probe(dir)) else {
                continue;
            };
            match dir_presence(&out.stdout) {
                Ok(false) => {}
                Ok(true) => found.push(format!("{dir} still exists")),
                Err(err) => found.push(format!("could not check {dir}: {err}")),
            }
        }
        for database in ["passwd", "group"] {
            let entry = query(database, &account_lookup(database, &service));
            if entry.is_some_and(|out| out.success()) {
                found.push(format!("{database} entry {service} remains"));
            }
        }
    }
    problems.extend(found);
    problems
}

/// The full phase table for `config`'s instance set.
pub fn build_plan<C>(config: &HarnessConfig) -> Result<PhasePlan<SuiteContext<C>>>
where
    C: Connect + 'static,
    C::Channel: 'static,
{
    let instances = config.instances.clone();
    let Some(first) = instances.first().cloned() else {
        bail!("the suite needs at least one instance");
    };
    let labels = joined_labels(&instances);

    let mut setup = PhaseGroup::new("Upload & environment").phase(
        "upload artifact",
        |ctx: &mut SuiteContext<C>| {
            let name = upload(&ctx.channel, &ctx.config.artifact_path, &ctx.config.tool_path)?;
            info!(name = %name, "provisioning tool uploaded");
            Ok(())
        },
    );
    for inst in &instances {
        let inst = inst.clone();
        setup = setup.phase(format!("gen-env {}", inst.label), move |ctx: &mut SuiteContext<C>| {
            ctx.require(&ctx.provisioner().gen_env(&inst))?;
            Ok(())
        });
    }

    let provisioning = PhaseGroup::new("Provisioning & health")
        .phase(format!("create {labels} (staggered)"), |ctx: &mut SuiteContext<C>| {
            let tool = ctx.provisioner();
            let limit = ctx.config.output_limit_bytes;
            let results = for_all_staggered(
                &ctx.channel,
                &ctx.instances,
                ctx.config.create_stagger(),
                |r, inst| probe_ok(&r.run(&tool.create(inst)), limit),
            );
            expect_all(&results)
        })
        .phase("services active", |ctx: &mut SuiteContext<C>| {
            services_active(&ctx.channel, &ctx.instances, ctx.config.output_limit_bytes)
        })
        .phase("workload run", |ctx: &mut SuiteContext<C>| {
            workload_runs(&ctx.channel, &ctx.config, &ctx.instances)
        })
        .phase("outbound ping", |ctx: &mut SuiteContext<C>| {
            outbound_ping(&ctx.channel, &ctx.config, &ctx.instances)
        })
        .phase("DNS resolution", |ctx: &mut SuiteContext<C>| {
            let cfg = &ctx.config;
            let args = format!("nslookup {}", cfg.dns_name);
            let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
                let out = r.run(&Engine::for_instance(inst).run_once(&cfg.workload_image, &args));
                probe_ok(&out, cfg.output_limit_bytes)?;
                if resolved(&out.stdout) {
                    Ok(())
                } else {
                    Err(format!(
                        "{} did not resolve: {}",
                        cfg.dns_name,
                        fragment(&out.combined(), cfg.output_limit_bytes)
                    ))
                }
            });
            expect_all(&results)
        });

    let nested = PhaseGroup::new("Nested engine & isolation")
        .phase("nested engine start", |ctx: &mut SuiteContext<C>| {
            let cfg = &ctx.config;
            let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
                start_nested(r, inst, &dind_name(inst), cfg)
            });
            expect_all(&results)
        })
        .phase("nested inner workload", |ctx: &mut SuiteContext<C>| {
            let cfg = &ctx.config;
            let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
                nested_workload(r, inst, &dind_name(inst), cfg)
            });
            expect_all(&results)
        })
        .phase("nested inner ping", |ctx: &mut SuiteContext<C>| {
            let cfg = &ctx.config;
            let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
                nested_ping(r, inst, &dind_name(inst), cfg)
            });
            expect_all(&results)
        })
        .phase(format!("isolation {labels}"), |ctx: &mut SuiteContext<C>| {
            let violations = check_isolation(
                &ctx.channel,
                &ctx.instances,
                &ctx.config.workload_image,
                ctx.config.output_limit_bytes,
            );
            if violations.is_empty() {
                Ok(())
            } else {
                bail!("{}", violations.join("; "))
            }
        })
        .cleanup(|ctx: &mut SuiteContext<C>| {
            for inst in &ctx.instances {
                let _ = ctx.channel.run(&Engine::for_instance(inst).remove(&dind_name(inst)));
            }
        });

    let edge = {
        let cycled = first.clone();
        PhaseGroup::new("Edge cases")
            .phase(format!("stop/start cycle {}", cycled.label), move |ctx: &mut SuiteContext<C>| {
                let service = cycled.service();
                ctx.require(&service_stop(&service))?;
                let state = ctx.channel.run(&service_active(&service));
                if state.exit_code == SESSION_FAILED_EXIT {
                    bail!("could not query {service}: {}", state.stderr.trim());
                }
                if state.stdout.trim() == "active" {
                    bail!("{service} still active after stop");
                }
                ctx.require(&service_start(&service))?;
                let engine = Engine::for_instance(&cycled);
                let out = ctx.require(&engine.run_once(&ctx.config.workload_image, "echo cycled"))?;
                if out.stdout.trim() != "cycled" {
                    bail!("expected \"cycled\" after restart, got {:?}", out.stdout.trim());
                }
                Ok(())
            })
            .phase("socket permissions", |ctx: &mut SuiteContext<C>| {
                let limit = ctx.config.output_limit_bytes;
                let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
                    let out = r.run(&socket_stat(&inst.socket));
                    probe_ok(&out, limit)?;
                    check_socket_stat(&out.stdout, &inst.socket, &inst.service())
                });
                expect_all(&results)
            })
    };

    let teardown_load = {
        let loaded = first.clone();
        let again = first.clone();
        let cleaned = first.clone();
        let under_load = format!("destroy {} under load", loaded.label);
        let double = format!("double destroy {}", again.label);
        let clean = format!("{} fully cleaned", cleaned.label);
        PhaseGroup::new("Teardown under load")
            .phase(under_load, move |ctx: &mut SuiteContext<C>| {
                let engine = Engine::for_instance(&loaded);
                ctx.require(&engine.run_detached(
                    &loaded.workload("load-test"),
                    &ctx.config.workload_image,
                    "sleep 300",
                ))
                .context("start load workload")?;
                ctx.require(&ctx.provisioner().destroy(&loaded))?;
                ctx.forget(&loaded);
                Ok(())
            })
            .phase(double, move |ctx: &mut SuiteContext<C>| {
                ctx.require(&ctx.provisioner().destroy(&again))
                    .context("second destroy must succeed")?;
                Ok(())
            })
            .phase(clean, move |ctx: &mut SuiteContext<C>| {
                let limit = ctx.config.output_limit_bytes;
                let problems = residue(&ctx.channel, &cleaned, false, limit);
                if problems.is_empty() {
                    Ok(())
                } else {
                    bail!("{}", problems.join("; "))
                }
            })
            .phase("survivors healthy", |ctx: &mut SuiteContext<C>| {
                outbound_ping(&ctx.channel, &ctx.config, &ctx.surviving)
            })
    };

    let reboot =
        PhaseGroup::new("Reboot").phase("reboot and reconnect", |ctx: &mut SuiteContext<C>| {
            // The session usually dies with the host; the exit status says nothing.
            let _ = ctx.channel.run("sudo reboot");
            thread::sleep(ctx.config.reboot_settle_down());
            ctx.connector
                .reconnect(&mut ctx.channel, ctx.config.reboot_max_wait())
                .context("reconnect after reboot")?;
            thread::sleep(ctx.config.reboot_settle_up());
            Ok(())
        });

    let post_reboot = PhaseGroup::new("Post-reboot")
        .phase("post-reboot services", |ctx: &mut SuiteContext<C>| {
            services_active(&ctx.channel, &ctx.surviving, ctx.config.output_limit_bytes)
        })
        .phase("post-reboot workload", |ctx: &mut SuiteContext<C>| {
            workload_runs(&ctx.channel, &ctx.config, &ctx.surviving)
        })
        .phase("post-reboot ping", |ctx: &mut SuiteContext<C>| {
            outbound_ping(&ctx.channel, &ctx.config, &ctx.surviving)
        })
        .phase("post-reboot nested", |ctx: &mut SuiteContext<C>| {
            let cfg = &ctx.config;
            let results = for_all(&ctx.channel, &ctx.surviving, |r, inst| {
                let name = inst.workload("dind-post");
                let outcome = start_nested(r, inst, &name, cfg)
                    .and_then(|()| nested_workload(r, inst, &name, cfg))
                    .and_then(|()| nested_ping(r, inst, &name, cfg));
                let _ = r.run(&Engine::for_instance(inst).remove(&name));
                outcome
            });
            expect_all(&results)
        });

    let mut teardown = PhaseGroup::new("Teardown");
    for inst in instances.iter().skip(1) {
        let inst = inst.clone();
        let name = format!("destroy {}", inst.label);
        teardown = teardown.phase(name, move |ctx: &mut SuiteContext<C>| {
            ctx.require(&ctx.provisioner().destroy(&inst))?;
            ctx.forget(&inst);
            Ok(())
        });
    }
    teardown = teardown.phase("full cleanup", |ctx: &mut SuiteContext<C>| {
        let limit = ctx.config.output_limit_bytes;
        let results = for_all(&ctx.channel, &ctx.instances, |r, inst| {
            let problems = residue(r, inst, true, limit);
            if problems.is_empty() {
                Ok(())
            } else {
                Err(problems.join("; "))
            }
        });
        expect_all(&results)
    });

    let nested_root_inst = config.nested_instance();
    let nested_root = {
        let inst = nested_root_inst.clone();
        let leftover = nested_root_inst;
        PhaseGroup::new("Nested root path")
            .phase("nested-root lifecycle", move |ctx: &mut SuiteContext<C>| {
                let tool = ctx.provisioner();
                for command in residue_cleanup(&tool, &inst) {
                    let _ = ctx.channel.run(&command);
                }
                ctx.require(&tool.gen_env(&inst)).context("gen-env")?;
                ctx.require(&tool.create(&inst)).context("create")?;
                let engine = Engine::for_instance(&inst);
                let out = ctx
                    .require(&engine.run_once(&ctx.config.workload_image, "echo nested-ok"))
                    .context("workload")?;
                if out.stdout.trim() != "nested-ok" {
                    bail!("expected \"nested-ok\", got {:?}", out.stdout.trim());
                }
                ctx.require(&tool.destroy(&inst)).context("destroy")?;
                let answer = ctx.require(&dir_probe(&inst.root))?;
                if dir_presence(&answer.stdout).map_err(anyhow::Error::msg)? {
                    bail!("{} still exists after destroy", inst.root);
                }
                Ok(())
            })
            .cleanup(move |ctx: &mut SuiteContext<C>| {
                for command in residue_cleanup(&ctx.provisioner(), &leftover) {
                    let _ = ctx.channel.run(&command);
                }
                let _ = ctx.channel.run(&remove_tree(&ctx.config.nested.scratch_dir));
            })
    };

    Ok(PhasePlan::new()
        .preflight(|ctx: &mut SuiteContext<C>| {
            let nested = ctx.config.nested_instance();
            let scratch = &ctx.config.nested.scratch_dir;
            for command in preflight_cleanup(&ctx.provisioner(), &ctx.instances, &nested, scratch) {
                let _ = ctx.channel.run(&command);
            }
        })
        .group(setup)
        .group(provisioning)
        .group(nested)
        .group(edge)
        .group(teardown_load)
        .group(reboot)
        .group(post_reboot)
        .group(teardown)
        .group(nested_root))
}

/// Run the whole suite, print the summary line and return the totals.
#[instrument(skip_all)]
pub fn run_suite<C, W>(
    ctx: &mut SuiteContext<C>,
    recorder: &mut Recorder<W>,
    deadline: Option<Instant>,
) -> Result<Summary>
where
    C: Connect + 'static,
    C::Channel: 'static,
    W: Write,
{
    let plan = build_plan::<C>(&ctx.config)?;
    run_plan(&plan, ctx, recorder, deadline);
    let summary = recorder.summary(plan.declared_total());
    recorder.emit(&format_summary_line(&summary));
    Ok(summary)
}
